//! Lease manager for coordinating workers across processes
//!
//! Leases live in the `scheduler_leases` table of the queue database, so
//! every process that drains the same queue sees the same holder. A lease is
//! taken with a single conditional upsert: the row is written only when no
//! row exists, the existing row has expired, or this manager already holds it.

use chrono::{DateTime, TimeZone, Utc};
use sqlx::SqlitePool;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::guard::LeaseGuard;
use super::types::{LeaseConfig, LeaseInfo, LeaseStatus};
use crate::error::{Error, Result};

/// Lease manager for named, TTL-bound leases
#[derive(Debug, Clone)]
pub struct LeaseManager {
    pool: SqlitePool,

    /// Configuration
    config: LeaseConfig,

    /// Holder identity written into every lease this manager takes
    holder: String,
}

impl LeaseManager {
    /// Create a new lease manager with the given configuration
    pub fn new(pool: SqlitePool, config: LeaseConfig) -> Self {
        let holder = format!("{}:{}", config.holder_description, Uuid::new_v4());
        Self {
            pool,
            config,
            holder,
        }
    }

    /// Create a lease manager with default configuration
    pub fn with_defaults(pool: SqlitePool) -> Self {
        Self::new(pool, LeaseConfig::default())
    }

    /// Get the configuration
    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    /// Holder identity of this manager
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Try to take a lease without waiting
    ///
    /// Returns `Ok(None)` when another live holder owns it.
    pub async fn try_acquire(&self, name: &str, ttl: Option<Duration>) -> Result<Option<LeaseGuard>> {
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        let info = LeaseInfo::new(name, self.holder.clone(), ttl);
        let now = Utc::now().timestamp_millis();

        let result = sqlx::query(
            r#"
            INSERT INTO scheduler_leases (
                name, lease_id, holder, holder_host, holder_pid, acquired_at, expires_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                lease_id = excluded.lease_id,
                holder = excluded.holder,
                holder_host = excluded.holder_host,
                holder_pid = excluded.holder_pid,
                acquired_at = excluded.acquired_at,
                expires_at = excluded.expires_at
            WHERE scheduler_leases.expires_at < ? OR scheduler_leases.holder = excluded.holder
            "#,
        )
        .bind(&info.name)
        .bind(info.lease_id.to_string())
        .bind(&info.holder)
        .bind(&info.holder_host)
        .bind(info.holder_pid as i64)
        .bind(info.acquired_at)
        .bind(info.expires_at.timestamp_millis())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        if result.rows_affected() == 0 {
            debug!(lease = %name, "Lease held by another worker");
            return Ok(None);
        }

        debug!(lease = %name, ttl_ms = ttl.as_millis() as u64, "Lease acquired");
        Ok(Some(LeaseGuard::new(info, self.pool.clone())))
    }

    /// Take a lease or fail with [`Error::LeaseHeld`]
    pub async fn acquire(&self, name: &str, ttl: Option<Duration>) -> Result<LeaseGuard> {
        self.try_acquire(name, ttl)
            .await?
            .ok_or_else(|| Error::LeaseHeld(name.to_string()))
    }

    /// Check the status of a lease
    pub async fn status(&self, name: &str) -> Result<LeaseStatus> {
        Ok(match self.info(name).await? {
            None => LeaseStatus::Available,
            Some(info) if info.is_expired() => LeaseStatus::Stale,
            Some(info) if info.holder == self.holder => LeaseStatus::HeldBySelf,
            Some(_) => LeaseStatus::HeldByOther,
        })
    }

    /// Get information about a lease
    pub async fn info(&self, name: &str) -> Result<Option<LeaseInfo>> {
        let row: Option<LeaseRow> = sqlx::query_as(
            r#"
            SELECT name, lease_id, holder, holder_host, holder_pid, acquired_at, expires_at
            FROM scheduler_leases
            WHERE name = ?
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        row.map(LeaseRow::into_info).transpose()
    }

    /// List every lease row, live or stale
    pub async fn list(&self) -> Result<Vec<LeaseInfo>> {
        let rows: Vec<LeaseRow> = sqlx::query_as(
            r#"
            SELECT name, lease_id, holder, holder_host, holder_pid, acquired_at, expires_at
            FROM scheduler_leases
            ORDER BY name
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        rows.into_iter().map(LeaseRow::into_info).collect()
    }

    /// Force release a lease regardless of holder
    pub async fn force_release(&self, name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM scheduler_leases WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;

        let removed = result.rows_affected() > 0;
        if removed {
            info!(lease = %name, "Lease force-released");
        }
        Ok(removed)
    }

    /// Remove expired lease rows
    pub async fn cleanup_stale(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM scheduler_leases WHERE expires_at < ?")
            .bind(Utc::now().timestamp_millis())
            .execute(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;

        let removed = result.rows_affected();
        if removed > 0 {
            warn!(count = removed, "Cleaned up stale leases");
        }
        Ok(removed)
    }
}

#[derive(sqlx::FromRow)]
struct LeaseRow {
    name: String,
    lease_id: String,
    holder: String,
    holder_host: String,
    holder_pid: i64,
    acquired_at: DateTime<Utc>,
    expires_at: i64,
}

impl LeaseRow {
    fn into_info(self) -> Result<LeaseInfo> {
        let lease_id = Uuid::parse_str(&self.lease_id)
            .map_err(|e| Error::Other(format!("Invalid lease ID: {}", e)))?;
        let expires_at = Utc
            .timestamp_millis_opt(self.expires_at)
            .single()
            .ok_or_else(|| Error::Other(format!("Invalid lease expiry: {}", self.expires_at)))?;

        Ok(LeaseInfo {
            name: self.name,
            lease_id,
            holder: self.holder,
            holder_host: self.holder_host,
            holder_pid: self.holder_pid as u32,
            acquired_at: self.acquired_at,
            expires_at,
        })
    }
}
