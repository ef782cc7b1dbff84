//! Lease types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Name of the lease that guards the indexing queue drain
pub const QUEUE_DRAIN_LEASE: &str = "queue-drain";

/// Lease status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseStatus {
    /// Nobody holds the lease
    Available,
    /// Held by this manager
    HeldBySelf,
    /// Held by another worker
    HeldByOther,
    /// A holder row exists but its TTL has passed
    Stale,
}

impl fmt::Display for LeaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Available => write!(f, "available"),
            Self::HeldBySelf => write!(f, "held_by_self"),
            Self::HeldByOther => write!(f, "held_by_other"),
            Self::Stale => write!(f, "stale"),
        }
    }
}

/// Information about a lease
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseInfo {
    /// Lease name, e.g. `queue-drain`
    pub name: String,

    /// Unique id of this acquisition
    pub lease_id: Uuid,

    /// Holder identity (description plus instance id)
    pub holder: String,

    /// Hostname of the lease holder
    pub holder_host: String,

    /// Process ID of the lease holder
    pub holder_pid: u32,

    /// When the lease was acquired
    pub acquired_at: DateTime<Utc>,

    /// When the lease lapses unless renewed
    pub expires_at: DateTime<Utc>,
}

impl LeaseInfo {
    /// Create lease info for the current process
    pub fn new(name: impl Into<String>, holder: impl Into<String>, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            lease_id: Uuid::new_v4(),
            holder: holder.into(),
            holder_host: gethostname::gethostname().to_string_lossy().into_owned(),
            holder_pid: std::process::id(),
            acquired_at: now,
            expires_at: now + chrono::Duration::from_std(ttl).unwrap_or_default(),
        }
    }

    /// Check if the lease is expired
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Push the expiry out by `ttl` from now
    pub fn renew(&mut self, ttl: Duration) {
        self.expires_at = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default();
    }

    /// Remaining time before expiry (zero once expired)
    pub fn remaining(&self) -> Duration {
        (self.expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }
}

impl fmt::Display for LeaseInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} held by {} ({}:{}) until {}",
            self.name,
            self.holder,
            self.holder_host,
            self.holder_pid,
            self.expires_at.to_rfc3339()
        )
    }
}

/// Configuration for the lease manager
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// Default TTL for leases
    pub default_ttl: Duration,

    /// Description recorded as the holder (e.g. "worker", "cli:drain")
    pub holder_description: String,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300), // 5 minutes
            holder_description: "searchgate".to_string(),
        }
    }
}

impl LeaseConfig {
    /// Set the default TTL
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Set the holder description
    pub fn with_holder(mut self, description: impl Into<String>) -> Self {
        self.holder_description = description.into();
        self
    }
}
