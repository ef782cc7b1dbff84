//! Indexing queue domain module
//!
//! Durable, at-least-once propagation of entity mutations into the search
//! index.
//!
//! # Architecture
//!
//! - **Entities**: `QueueItem`, `ChangeKind`, `BatchAcknowledgment`
//! - **Traits**: `IndexedEntity`, `EntityIndexer`, `EntitySource`, `DocumentLoader`
//! - **Repository**: `QueueRepository` (claim / delete-acknowledged / release)
//! - **Service**: `IndexingQueueService` (enqueue inside the caller's
//!   transaction, batch drain, maintenance)

pub mod entity;
pub mod indexer;
pub mod repository;
pub mod service;
pub mod source;

pub use entity::{
    BatchAcknowledgment, ChangeKind, EntityRef, IndexedEntity, ItemOutcome, ProcessReport,
    QueueItem, QueueStats,
};
pub use indexer::EntityIndexer;
pub use repository::QueueRepository;
pub use service::{DEFAULT_CLAIM_TTL, IndexingQueueService, RunControl};
pub use source::{DocumentLoader, EntitySource};
