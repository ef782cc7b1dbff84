//! Indexing queue service
//!
//! Records entity mutations inside the caller's transaction and drains them
//! into the search backend through an [`EntityIndexer`].

use futures_util::FutureExt;
use sqlx::{SqliteConnection, SqlitePool};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::entity::{ChangeKind, EntityRef, IndexedEntity, ProcessReport, QueueItem, QueueStats};
use super::indexer::EntityIndexer;
use super::repository::QueueRepository;
use super::source::EntitySource;
use crate::domain::security::Principal;
use crate::error::{Error, Result};

/// Default claim lifetime for a drained batch
pub const DEFAULT_CLAIM_TTL: Duration = Duration::from_secs(600);

/// Cooperative stop signals checked between batches
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether the run should stop before claiming another batch
    pub fn should_stop(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// Service for the durable indexing queue
#[derive(Clone)]
pub struct IndexingQueueService {
    repository: QueueRepository,
    indexer: Arc<dyn EntityIndexer>,
    source: Option<Arc<dyn EntitySource>>,
    claim_ttl: Duration,
}

impl IndexingQueueService {
    /// Create a new queue service draining into `indexer`
    pub fn new(pool: SqlitePool, indexer: Arc<dyn EntityIndexer>) -> Self {
        Self {
            repository: QueueRepository::new(pool),
            indexer,
            source: None,
            claim_ttl: DEFAULT_CLAIM_TTL,
        }
    }

    /// Attach the source used by [`enqueue_all`](Self::enqueue_all)
    pub fn with_source(mut self, source: Arc<dyn EntitySource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_claim_ttl(mut self, claim_ttl: Duration) -> Self {
        self.claim_ttl = claim_ttl;
        self
    }

    /// Get the underlying repository
    pub fn repository(&self) -> &QueueRepository {
        &self.repository
    }

    // ========== Enqueue ==========

    /// Queue one entity instance on the caller's connection
    ///
    /// Run this on the same transaction as the mutation that triggered it so
    /// both commit or roll back together. Errors are not retried here.
    pub async fn enqueue<E>(
        &self,
        conn: &mut SqliteConnection,
        entity: &E,
        change_kind: ChangeKind,
    ) -> Result<QueueItem>
    where
        E: IndexedEntity + ?Sized,
    {
        let item = QueueItem::new(entity, change_kind);
        self.repository
            .insert(conn, std::slice::from_ref(&item))
            .await?;
        debug!(
            entity_type = %item.entity_type,
            entity_id = %item.entity_id,
            change_kind = %change_kind,
            "Queued entity for indexing"
        );
        Ok(item)
    }

    /// Queue several entity instances on the caller's connection
    pub async fn enqueue_many<E>(
        &self,
        conn: &mut SqliteConnection,
        entities: &[E],
        change_kind: ChangeKind,
    ) -> Result<usize>
    where
        E: IndexedEntity,
    {
        let items: Vec<_> = entities
            .iter()
            .map(|e| QueueItem::new(e, change_kind))
            .collect();
        self.repository.insert(conn, &items).await?;
        Ok(items.len())
    }

    /// Queue instances of one entity type by primary key
    pub async fn enqueue_ids<S>(
        &self,
        conn: &mut SqliteConnection,
        entity_type: &str,
        ids: &[S],
        change_kind: ChangeKind,
    ) -> Result<usize>
    where
        S: AsRef<str>,
    {
        let items: Vec<_> = ids
            .iter()
            .map(|id| QueueItem::new(&EntityRef::new(entity_type, id.as_ref()), change_kind))
            .collect();
        self.repository.insert(conn, &items).await?;
        Ok(items.len())
    }

    /// Queue every existing instance of a type for reindexing
    ///
    /// Runs as [`Principal::System`]. Each batch is committed in its own
    /// transaction, so a failure part-way keeps the batches already queued.
    pub async fn enqueue_all(&self, entity_type: &str, batch_size: u32) -> Result<usize> {
        if batch_size == 0 {
            return Err(Error::InvalidInput("batch size must be positive".to_string()));
        }
        let source = self
            .source
            .as_ref()
            .ok_or_else(|| Error::UnknownEntityType(entity_type.to_string()))?;

        let principal = Principal::system();
        let mut after: Option<String> = None;
        let mut total = 0;

        loop {
            let refs = source
                .load_refs(&principal, entity_type, after.as_deref(), batch_size)
                .await?;
            if refs.is_empty() {
                break;
            }

            let items: Vec<_> = refs
                .iter()
                .map(|r| QueueItem::new(r, ChangeKind::Updated))
                .collect();

            let mut tx = self
                .repository
                .pool()
                .begin()
                .await
                .map_err(Error::DatabaseError)?;
            self.repository.insert(&mut tx, &items).await?;
            tx.commit().await.map_err(Error::DatabaseError)?;

            total += items.len();
            after = refs.last().map(|r| r.entity_id.clone());
            debug!(entity_type, queued = total, "Queued reindex batch");

            if refs.len() < batch_size as usize {
                break;
            }
        }

        info!(entity_type, queued = total, "Queued entity type for reindexing");
        Ok(total)
    }

    // ========== Drain ==========

    /// Drain the queue and return the number of acknowledged items
    pub async fn process_queue(&self, batch_size: u32, max_processed: u32) -> Result<usize> {
        let report = self
            .process_queue_with(batch_size, max_processed, &RunControl::default())
            .await?;
        Ok(report.processed)
    }

    /// Drain the queue under cancellation and deadline control
    ///
    /// Claims batches oldest-first until a batch comes back short, the
    /// `max_processed` budget is spent or `control` says stop. Only items the
    /// indexer acknowledged are deleted. Every claim still held when the run
    /// ends is released, whether the run succeeded or not.
    pub async fn process_queue_with(
        &self,
        batch_size: u32,
        max_processed: u32,
        control: &RunControl,
    ) -> Result<ProcessReport> {
        if batch_size == 0 || max_processed == 0 {
            return Err(Error::InvalidInput(
                "batch size and max processed must be positive".to_string(),
            ));
        }

        let worker = worker_id();
        let mut report = ProcessReport::default();
        // Claims are released even when the indexer panics
        let drained = AssertUnwindSafe(self.drain(
            &worker,
            batch_size,
            max_processed,
            control,
            &mut report,
        ))
        .catch_unwind()
        .await;

        let released = self.repository.release_claims(&worker).await;
        match &released {
            Ok(count) if *count > 0 => {
                debug!(worker = %worker, released = count, "Released unacknowledged items");
            }
            Ok(_) => {}
            // Claims expire on their own after the claim TTL
            Err(e) => warn!(worker = %worker, error = %e, "Failed to release queue claims"),
        }

        let outcome = match drained {
            Ok(outcome) => outcome,
            Err(payload) => {
                error!(worker = %worker, "Indexing queue run panicked");
                panic::resume_unwind(payload)
            }
        };
        if outcome.is_ok() {
            released?;
        }

        match outcome {
            Ok(()) => {
                info!(
                    processed = report.processed,
                    failed = report.failed,
                    batches = report.batches,
                    stopped_early = report.stopped_early,
                    "Indexing queue run finished"
                );
                Ok(report)
            }
            Err(e) => {
                error!(
                    processed = report.processed,
                    batches = report.batches,
                    error = %e,
                    "Indexing queue run failed"
                );
                Err(e)
            }
        }
    }

    async fn drain(
        &self,
        worker: &str,
        batch_size: u32,
        max_processed: u32,
        control: &RunControl,
        report: &mut ProcessReport,
    ) -> Result<()> {
        let principal = Principal::system();
        let mut handled: u32 = 0;

        loop {
            if control.should_stop() {
                report.stopped_early = true;
                return Ok(());
            }

            let limit = batch_size.min(max_processed - handled);
            let batch = self
                .repository
                .claim_batch(worker, limit, self.claim_ttl)
                .await?;
            if batch.is_empty() {
                return Ok(());
            }
            report.batches += 1;

            let ack = match self.indexer.index_batch(&principal, &batch).await {
                Ok(ack) => ack,
                Err(e) => {
                    let reason = e.to_string();
                    for item in &batch {
                        if let Err(record_error) =
                            self.repository.record_failure(worker, item.id, &reason).await
                        {
                            warn!(
                                item_id = %item.id,
                                error = %record_error,
                                "Failed to record queue item failure"
                            );
                        }
                    }
                    return Err(e);
                }
            };

            let (applied, failed) = ack.partition(&batch);
            let deleted = self.repository.delete_claimed(worker, &applied).await?;
            if deleted as usize != applied.len() {
                warn!(
                    acknowledged = applied.len(),
                    deleted, "Claim expired before acknowledged items were deleted"
                );
            }

            for (id, reason) in &failed {
                warn!(item_id = %id, reason = %reason, "Queue item not applied; will retry");
                self.repository.record_failure(worker, *id, reason).await?;
            }

            report.processed += deleted as usize;
            report.failed += failed.len();
            handled += batch.len() as u32;

            if batch.len() < limit as usize || handled >= max_processed {
                return Ok(());
            }
        }
    }

    // ========== Maintenance ==========

    /// Delete every queued item of an entity type
    pub async fn empty_queue(&self, entity_type: &str) -> Result<u64> {
        let deleted = self.repository.delete_by_entity_type(entity_type).await?;
        info!(entity_type, deleted, "Emptied indexing queue");
        Ok(deleted)
    }

    /// Number of queued items, optionally for one entity type
    pub async fn depth(&self, entity_type: Option<&str>) -> Result<i64> {
        self.repository.count(entity_type).await
    }

    /// Queue counts per entity type
    pub async fn stats(&self) -> Result<Vec<QueueStats>> {
        self.repository.stats().await
    }
}

impl std::fmt::Debug for IndexingQueueService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexingQueueService")
            .field("repository", &self.repository)
            .field("has_source", &self.source.is_some())
            .field("claim_ttl", &self.claim_ttl)
            .finish()
    }
}

/// Claim owner for one drain run
fn worker_id() -> String {
    format!(
        "{}:{}:{}",
        gethostname::gethostname().to_string_lossy(),
        std::process::id(),
        Uuid::new_v4()
    )
}
