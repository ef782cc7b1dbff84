//! Queue repository for database operations
//!
//! All reads that feed the drain loop go through [`QueueRepository::claim_batch`],
//! which stamps the selected rows with a worker id in the same statement that
//! selects them. Writers that enqueue only ever insert unclaimed rows, so they
//! never contend with a running drain beyond SQLite's own write lock.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use std::time::Duration;
use uuid::Uuid;

use super::entity::{ChangeKind, QueueItem, QueueStats};
use crate::error::{Error, Result};
use crate::storage::placeholders;

/// Repository for queue database operations
#[derive(Debug, Clone)]
pub struct QueueRepository {
    pool: SqlitePool,
}

impl QueueRepository {
    /// Create a new repository with the given connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get a reference to the underlying connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ========== Enqueue ==========

    /// Insert items on the caller's connection
    ///
    /// Pass `&mut *tx` to make the insert part of an open transaction.
    pub async fn insert(&self, conn: &mut SqliteConnection, items: &[QueueItem]) -> Result<()> {
        for item in items {
            sqlx::query(
                r#"
                INSERT INTO search_index_queue (
                    id, entity_type, entity_id, entity_name, change_kind, created_at, attempts
                ) VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(item.id.to_string())
            .bind(&item.entity_type)
            .bind(&item.entity_id)
            .bind(&item.entity_name)
            .bind(item.change_kind.as_str())
            .bind(timestamp(&item.created_at))
            .bind(item.attempts as i64)
            .execute(&mut *conn)
            .await
            .map_err(Error::DatabaseError)?;
        }
        Ok(())
    }

    // ========== Drain ==========

    /// Claim up to `limit` of the oldest eligible items for `worker`
    ///
    /// Eligible rows are unclaimed or carry an expired claim. The returned
    /// batch is in ascending `(created_at, id)` order.
    pub async fn claim_batch(
        &self,
        worker: &str,
        limit: u32,
        claim_ttl: Duration,
    ) -> Result<Vec<QueueItem>> {
        let now = Utc::now().timestamp_millis();
        let expires_at = now.saturating_add(claim_ttl.as_millis() as i64);

        let rows: Vec<QueueRow> = sqlx::query_as(
            r#"
            UPDATE search_index_queue
            SET claimed_by = ?, claim_expires_at = ?
            WHERE id IN (
                SELECT id FROM search_index_queue
                WHERE claimed_by IS NULL OR claim_expires_at IS NULL OR claim_expires_at < ?
                ORDER BY created_at, id
                LIMIT ?
            )
            RETURNING id, entity_type, entity_id, entity_name, change_kind, created_at, attempts
            "#,
        )
        .bind(worker)
        .bind(expires_at)
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        let mut items = rows
            .into_iter()
            .map(QueueRow::into_item)
            .collect::<Result<Vec<_>>>()?;
        // RETURNING order is unspecified
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(items)
    }

    /// Delete acknowledged items still claimed by `worker`
    pub async fn delete_claimed(&self, worker: &str, ids: &[Uuid]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let sql = format!(
            "DELETE FROM search_index_queue WHERE claimed_by = ? AND id IN ({})",
            placeholders(ids.len())
        );
        let mut query = sqlx::query(&sql).bind(worker);
        for id in ids {
            query = query.bind(id.to_string());
        }

        let result = query
            .execute(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;
        Ok(result.rows_affected())
    }

    /// Record a failed delivery attempt without releasing the claim
    pub async fn record_failure(&self, worker: &str, id: Uuid, reason: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE search_index_queue
            SET attempts = attempts + 1, last_error = ?
            WHERE id = ? AND claimed_by = ?
            "#,
        )
        .bind(reason)
        .bind(id.to_string())
        .bind(worker)
        .execute(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;
        Ok(())
    }

    /// Release every claim held by `worker`
    pub async fn release_claims(&self, worker: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE search_index_queue
            SET claimed_by = NULL, claim_expires_at = NULL
            WHERE claimed_by = ?
            "#,
        )
        .bind(worker)
        .execute(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;
        Ok(result.rows_affected())
    }

    // ========== Maintenance ==========

    /// Delete every queued item of an entity type, claimed or not
    pub async fn delete_by_entity_type(&self, entity_type: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM search_index_queue WHERE entity_type = ?")
            .bind(entity_type)
            .execute(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;
        Ok(result.rows_affected())
    }

    /// Number of queued items, optionally for one entity type
    pub async fn count(&self, entity_type: Option<&str>) -> Result<i64> {
        let (count,): (i64,) = match entity_type {
            Some(entity_type) => {
                sqlx::query_as("SELECT COUNT(*) FROM search_index_queue WHERE entity_type = ?")
                    .bind(entity_type)
                    .fetch_one(&self.pool)
                    .await
            }
            None => {
                sqlx::query_as("SELECT COUNT(*) FROM search_index_queue")
                    .fetch_one(&self.pool)
                    .await
            }
        }
        .map_err(Error::DatabaseError)?;
        Ok(count)
    }

    /// Pending, claimed and retried counts per entity type
    pub async fn stats(&self) -> Result<Vec<QueueStats>> {
        let now = Utc::now().timestamp_millis();
        let rows: Vec<(String, i64, i64, i64)> = sqlx::query_as(
            r#"
            SELECT entity_type,
                   COUNT(*),
                   COALESCE(SUM(CASE WHEN claimed_by IS NOT NULL AND claim_expires_at >= ? THEN 1 ELSE 0 END), 0),
                   COALESCE(SUM(CASE WHEN attempts > 0 THEN 1 ELSE 0 END), 0)
            FROM search_index_queue
            GROUP BY entity_type
            ORDER BY entity_type
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        Ok(rows
            .into_iter()
            .map(|(entity_type, pending, claimed, retried)| QueueStats {
                entity_type,
                pending,
                claimed,
                retried,
            })
            .collect())
    }

    /// Oldest items without claiming them
    pub async fn peek(&self, limit: u32) -> Result<Vec<QueueItem>> {
        let rows: Vec<QueueRow> = sqlx::query_as(
            r#"
            SELECT id, entity_type, entity_id, entity_name, change_kind, created_at, attempts
            FROM search_index_queue
            ORDER BY created_at, id
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        rows.into_iter().map(QueueRow::into_item).collect()
    }

    /// Last recorded error for an item, if it failed before
    pub async fn last_error(&self, id: Uuid) -> Result<Option<String>> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT last_error FROM search_index_queue WHERE id = ?")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(Error::DatabaseError)?;
        Ok(row.and_then(|(e,)| e))
    }
}

/// Fixed-width RFC 3339 so text ordering matches time ordering
fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[derive(sqlx::FromRow)]
struct QueueRow {
    id: String,
    entity_type: String,
    entity_id: String,
    entity_name: Option<String>,
    change_kind: String,
    created_at: DateTime<Utc>,
    attempts: i64,
}

impl QueueRow {
    fn into_item(self) -> Result<QueueItem> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| Error::Other(format!("Invalid queue item ID: {}", e)))?;

        Ok(QueueItem {
            id,
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            entity_name: self.entity_name,
            change_kind: self.change_kind.parse::<ChangeKind>()?,
            created_at: self.created_at,
            attempts: self.attempts.max(0) as u32,
        })
    }
}
