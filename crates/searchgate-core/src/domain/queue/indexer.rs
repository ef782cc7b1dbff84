//! Entity indexer seam
//!
//! The queue hands every claimed batch to an [`EntityIndexer`], which turns
//! the items into backend operations and reports which of them were applied.

use async_trait::async_trait;

use super::entity::{BatchAcknowledgment, QueueItem};
use crate::domain::security::Principal;
use crate::error::Result;

/// Applies queue items to the search backend
///
/// Implementations must be idempotent under redelivery: applying the same
/// item twice yields the same backend document as applying it once
/// (upsert-by-id, delete-by-id).
///
/// `Err` means the whole batch failed and must be retried as a unit. `Ok`
/// carries per-item outcomes; items without an `Applied` outcome stay queued.
#[async_trait]
pub trait EntityIndexer: Send + Sync {
    async fn index_batch(
        &self,
        principal: &Principal,
        items: &[QueueItem],
    ) -> Result<BatchAcknowledgment>;
}
