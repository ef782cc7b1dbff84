//! Lease guards for RAII-style lease management
//!
//! Prefer [`LeaseGuard::release`]. Dropping an unreleased guard schedules the
//! release on the current runtime; without a runtime the lease simply lapses
//! at its TTL.

use sqlx::SqlitePool;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

use super::types::LeaseInfo;
use crate::error::{Error, Result};

/// A held lease on a named resource
pub struct LeaseGuard {
    /// Information about the held lease
    info: LeaseInfo,

    pool: SqlitePool,

    /// Whether the lease has been explicitly released
    released: bool,
}

impl LeaseGuard {
    pub(crate) fn new(info: LeaseInfo, pool: SqlitePool) -> Self {
        Self {
            info,
            pool,
            released: false,
        }
    }

    /// Get the lease name
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Get the lease info
    pub fn info(&self) -> &LeaseInfo {
        &self.info
    }

    /// Check if the lease is still valid (not expired)
    pub fn is_valid(&self) -> bool {
        !self.released && !self.info.is_expired()
    }

    /// Extend the lease by `ttl` from now
    ///
    /// Fails with [`Error::LeaseHeld`] when the lease lapsed and was taken
    /// over in the meantime.
    pub async fn renew(&mut self, ttl: Duration) -> Result<()> {
        let mut renewed = self.info.clone();
        renewed.renew(ttl);

        let result = sqlx::query(
            "UPDATE scheduler_leases SET expires_at = ? WHERE name = ? AND lease_id = ?",
        )
        .bind(renewed.expires_at.timestamp_millis())
        .bind(&self.info.name)
        .bind(self.info.lease_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        if result.rows_affected() == 0 {
            return Err(Error::LeaseHeld(self.info.name.clone()));
        }
        self.info = renewed;
        Ok(())
    }

    /// Release the lease
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        delete_lease(&self.pool, &self.info).await
    }
}

async fn delete_lease(pool: &SqlitePool, info: &LeaseInfo) -> Result<()> {
    sqlx::query("DELETE FROM scheduler_leases WHERE name = ? AND lease_id = ?")
        .bind(&info.name)
        .bind(info.lease_id.to_string())
        .execute(pool)
        .await
        .map_err(Error::DatabaseError)?;
    debug!(lease = %info.name, "Lease released");
    Ok(())
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let pool = self.pool.clone();
                let info = self.info.clone();
                handle.spawn(async move {
                    if let Err(e) = delete_lease(&pool, &info).await {
                        warn!(lease = %info.name, error = %e, "Failed to release dropped lease");
                    }
                });
            }
            Err(_) => {
                warn!(lease = %self.info.name, "Lease dropped outside a runtime; it will lapse at its TTL");
            }
        }
    }
}

impl fmt::Debug for LeaseGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseGuard")
            .field("info", &self.info)
            .field("released", &self.released)
            .finish()
    }
}

impl fmt::Display for LeaseGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Lease[{}]", self.info.name)
    }
}
