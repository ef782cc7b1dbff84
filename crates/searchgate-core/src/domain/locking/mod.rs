//! Worker leases for cross-process mutual exclusion
//!
//! The indexing scheduler may be hosted by more than one process against the
//! same queue database. A named lease in `scheduler_leases` makes sure only one
//! of them drains the queue at a time.
//!
//! # Architecture
//!
//! - **Types**: `LeaseInfo`, `LeaseStatus`, `LeaseConfig`
//! - **Lease Manager**: `LeaseManager` for taking and inspecting leases
//! - **Guards**: `LeaseGuard` with explicit async release and a drop fallback
//!
//! # Example
//!
//! ```ignore
//! use searchgate_core::domain::locking::{LeaseManager, QUEUE_DRAIN_LEASE};
//!
//! let manager = LeaseManager::with_defaults(pool);
//! if let Some(lease) = manager.try_acquire(QUEUE_DRAIN_LEASE, None).await? {
//!     // drain the queue...
//!     lease.release().await?;
//! }
//! ```

pub mod guard;
pub mod manager;
pub mod types;

pub use guard::LeaseGuard;
pub use manager::LeaseManager;
pub use types::{LeaseConfig, LeaseInfo, LeaseStatus, QUEUE_DRAIN_LEASE};
