//! Recurring queue drain
//!
//! Each tick is guarded twice: an in-process mutex keeps ticks of this
//! scheduler from overlapping, and the `queue-drain` lease keeps schedulers in
//! other processes out. The delay is measured from the end of one tick to the
//! start of the next.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::domain::locking::{LeaseManager, QUEUE_DRAIN_LEASE};
use crate::domain::queue::{IndexingQueueService, ProcessReport, RunControl};

/// Scheduler timing and batch settings
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Fixed delay between the end of a tick and the start of the next
    pub interval: Duration,
    pub batch_size: u32,
    pub max_processed_per_execution: u32,
    /// TTL of the drain lease taken for each tick
    pub lease_ttl: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from(&QueueConfig::default())
    }
}

impl From<&QueueConfig> for SchedulerSettings {
    fn from(config: &QueueConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.interval_secs),
            batch_size: config.batch_size,
            max_processed_per_execution: config.max_processed_per_execution,
            lease_ttl: Duration::from_secs(config.lease_ttl_secs),
        }
    }
}

impl SchedulerSettings {
    /// Deadline for a run so it ends well inside the lease TTL
    pub fn run_budget(&self) -> Duration {
        self.lease_ttl.mul_f64(0.75)
    }
}

/// What a single tick did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TickOutcome {
    /// The queue was drained (possibly partially)
    Processed(ProcessReport),
    /// Another tick or another process holds the drain
    Skipped,
    /// The drain failed or panicked; the next tick still runs
    Failed(String),
}

/// Drives `process_queue` on a fixed delay
#[derive(Debug, Clone)]
pub struct IndexingScheduler {
    service: IndexingQueueService,
    leases: LeaseManager,
    settings: SchedulerSettings,
    running: Arc<Mutex<()>>,
}

impl IndexingScheduler {
    pub fn new(
        service: IndexingQueueService,
        leases: LeaseManager,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            service,
            leases,
            settings,
            running: Arc::new(Mutex::new(())),
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// Run one drain if nothing else is draining
    pub async fn tick(&self) -> TickOutcome {
        self.tick_with(&CancellationToken::new()).await
    }

    /// Run one drain, stopping between batches once `cancel` fires
    pub async fn tick_with(&self, cancel: &CancellationToken) -> TickOutcome {
        let Ok(_running) = self.running.try_lock() else {
            debug!("Previous tick still running; skipping");
            return TickOutcome::Skipped;
        };

        let service = self.service.clone();
        let leases = self.leases.clone();
        let settings = self.settings.clone();
        let cancel = cancel.clone();

        // A panic inside the drain surfaces as a JoinError instead of
        // unwinding through the scheduler loop
        let handle = tokio::spawn(async move {
            let lease = match leases
                .try_acquire(QUEUE_DRAIN_LEASE, Some(settings.lease_ttl))
                .await
            {
                Ok(Some(lease)) => lease,
                Ok(None) => {
                    debug!("Queue drain lease held elsewhere; skipping");
                    return TickOutcome::Skipped;
                }
                Err(e) => return TickOutcome::Failed(e.to_string()),
            };

            let control = RunControl::new()
                .with_cancel(cancel)
                .with_deadline(Instant::now() + settings.run_budget());
            let result = service
                .process_queue_with(
                    settings.batch_size,
                    settings.max_processed_per_execution,
                    &control,
                )
                .await;

            if let Err(e) = lease.release().await {
                warn!(error = %e, "Failed to release queue drain lease");
            }

            match result {
                Ok(report) => TickOutcome::Processed(report),
                Err(e) => TickOutcome::Failed(e.to_string()),
            }
        });

        match handle.await {
            Ok(outcome) => {
                if let TickOutcome::Failed(message) = &outcome {
                    error!(error = %message, "Indexing queue tick failed");
                }
                outcome
            }
            Err(e) => {
                error!(error = %e, "Indexing queue tick panicked");
                TickOutcome::Failed(format!("tick panicked: {}", e))
            }
        }
    }

    /// Tick on a fixed delay until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            interval_ms = self.settings.interval.as_millis() as u64,
            batch_size = self.settings.batch_size,
            max_processed = self.settings.max_processed_per_execution,
            "Indexing scheduler started"
        );

        while !cancel.is_cancelled() {
            self.tick_with(&cancel).await;

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.interval) => {}
            }
        }

        info!("Indexing scheduler stopped");
    }

    /// Run the scheduler loop in a background task
    pub fn spawn(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.run(cancel).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::locking::LeaseConfig;
    use crate::domain::queue::{BatchAcknowledgment, ChangeKind, EntityIndexer, QueueItem};
    use crate::domain::security::Principal;
    use crate::error::{Error, Result};
    use crate::storage::Database;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Flaky {
        calls: AtomicUsize,
        panic_first: bool,
        fail_first: bool,
    }

    #[async_trait]
    impl EntityIndexer for Flaky {
        async fn index_batch(
            &self,
            _principal: &Principal,
            items: &[QueueItem],
        ) -> Result<BatchAcknowledgment> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call == 0 && self.panic_first {
                panic!("indexer bug");
            }
            if call == 0 && self.fail_first {
                return Err(Error::IndexingFailed("backend rejected bulk".into()));
            }
            Ok(BatchAcknowledgment::all_applied(items))
        }
    }

    fn settings() -> SchedulerSettings {
        SchedulerSettings {
            interval: Duration::from_millis(10),
            batch_size: 10,
            max_processed_per_execution: 100,
            lease_ttl: Duration::from_secs(60),
        }
    }

    async fn scheduler_with(indexer: Flaky) -> (Database, IndexingScheduler) {
        let db = Database::in_memory().await.unwrap();
        let service = IndexingQueueService::new(db.pool().clone(), Arc::new(indexer));

        let mut tx = db.pool().begin().await.unwrap();
        service
            .enqueue_ids(&mut tx, "sales_Order", &["1", "2", "3"], ChangeKind::Created)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let leases = LeaseManager::new(db.pool().clone(), LeaseConfig::default().with_holder("test"));
        (db, IndexingScheduler::new(service, leases, settings()))
    }

    #[test]
    fn test_run_budget_is_inside_lease() {
        let settings = settings();
        assert_eq!(settings.run_budget(), Duration::from_secs(45));
        assert_eq!(SchedulerSettings::default().interval, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_tick_processes_queue() {
        let (_db, scheduler) = scheduler_with(Flaky::default()).await;

        match scheduler.tick().await {
            TickOutcome::Processed(report) => assert_eq!(report.processed, 3),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(scheduler.service.depth(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_tick_skips_when_lease_held_elsewhere() {
        let (db, scheduler) = scheduler_with(Flaky::default()).await;
        let other = LeaseManager::new(db.pool().clone(), LeaseConfig::default().with_holder("other"));
        let lease = other.acquire(QUEUE_DRAIN_LEASE, None).await.unwrap();

        assert_eq!(scheduler.tick().await, TickOutcome::Skipped);
        assert_eq!(scheduler.service.depth(None).await.unwrap(), 3);

        lease.release().await.unwrap();
        assert!(matches!(scheduler.tick().await, TickOutcome::Processed(_)));
    }

    #[tokio::test]
    async fn test_tick_skips_while_previous_tick_runs() {
        let (_db, scheduler) = scheduler_with(Flaky::default()).await;
        let _running = scheduler.running.lock().await;

        assert_eq!(scheduler.tick().await, TickOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_next_tick() {
        let (_db, scheduler) = scheduler_with(Flaky {
            fail_first: true,
            ..Default::default()
        })
        .await;

        assert!(matches!(scheduler.tick().await, TickOutcome::Failed(_)));
        // The lease was released on failure
        assert!(matches!(scheduler.tick().await, TickOutcome::Processed(_)));
        assert_eq!(scheduler.service.depth(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_panicking_tick_is_contained() {
        let (_db, scheduler) = scheduler_with(Flaky {
            panic_first: true,
            ..Default::default()
        })
        .await;

        match scheduler.tick().await {
            TickOutcome::Failed(message) => assert!(message.contains("panicked")),
            other => panic!("unexpected outcome: {:?}", other),
        }

        // Let the dropped lease guard's release task run
        tokio::time::sleep(Duration::from_millis(20)).await;
        match scheduler.tick().await {
            TickOutcome::Processed(report) => assert_eq!(report.processed, 3),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(scheduler.service.depth(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_run_loop_stops_on_cancel() {
        let (_db, scheduler) = scheduler_with(Flaky::default()).await;
        let cancel = CancellationToken::new();

        let handle = scheduler.spawn(cancel.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(scheduler.service.depth(None).await.unwrap(), 0);
    }
}
