//! Searchgate Core Library
//!
//! This crate provides the core functionality for Searchgate, including:
//! - Durable indexing queue with claim-based, at-least-once delivery
//! - Scheduler draining the queue under a cross-process lease
//! - Paginated search with row-level security compensation
//! - Elasticsearch and OpenSearch backends
//! - Storage (SQLite)

pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod storage;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::application::Searchgate;
    pub use crate::config::Config;
    pub use crate::domain::queue::{ChangeKind, EntityRef, IndexedEntity, IndexingQueueService};
    pub use crate::domain::search::{EntitySearcher, SearchContext, SearchResult};
    pub use crate::domain::security::Principal;
    pub use crate::error::{Error, Result};
}
