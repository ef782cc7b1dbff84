//! Queue entity and related types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::Error;

/// Kind of mutation that made an entity instance stale in the index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

impl ChangeKind {
    /// Convert to the stored representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Updated => "UPDATED",
            Self::Deleted => "DELETED",
        }
    }

    /// Whether the backend document should be removed rather than upserted
    pub fn is_removal(&self) -> bool {
        matches!(self, Self::Deleted)
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ChangeKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CREATED" => Ok(Self::Created),
            "UPDATED" => Ok(Self::Updated),
            "DELETED" => Ok(Self::Deleted),
            _ => Err(Error::InvalidChangeKind(s.to_string())),
        }
    }
}

/// Something that can be put on the indexing queue
pub trait IndexedEntity {
    /// Entity type name, e.g. `sales_Order`
    fn entity_type(&self) -> &str;

    /// Serialized primary key
    fn primary_key(&self) -> String;

    /// Display name to store alongside the key, if it differs from the key
    fn instance_name(&self) -> Option<String> {
        None
    }
}

/// Lightweight reference to an entity instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: String,
    pub entity_id: String,
    pub entity_name: Option<String>,
}

impl EntityRef {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            entity_name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.entity_name = Some(name.into());
        self
    }
}

impl IndexedEntity for EntityRef {
    fn entity_type(&self) -> &str {
        &self.entity_type
    }

    fn primary_key(&self) -> String {
        self.entity_id.clone()
    }

    fn instance_name(&self) -> Option<String> {
        self.entity_name.clone()
    }
}

/// A durable record of one pending index mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Time-ordered identifier (UUIDv7)
    pub id: Uuid,
    pub entity_type: String,
    pub entity_id: String,
    pub entity_name: Option<String>,
    pub change_kind: ChangeKind,
    pub created_at: DateTime<Utc>,
    /// Failed delivery attempts so far
    pub attempts: u32,
}

impl QueueItem {
    /// Create a new queue item for an entity instance
    pub fn new<E: IndexedEntity + ?Sized>(entity: &E, change_kind: ChangeKind) -> Self {
        Self {
            id: Uuid::now_v7(),
            entity_type: entity.entity_type().to_string(),
            entity_id: entity.primary_key(),
            entity_name: entity.instance_name(),
            change_kind,
            created_at: Utc::now(),
            attempts: 0,
        }
    }

    /// Key identifying the backend document this item targets
    pub fn document_key(&self) -> (&str, &str) {
        (&self.entity_type, &self.entity_id)
    }
}

/// Result of applying one queue item to the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    /// The backend applied the operation; the item may be deleted
    Applied,
    /// The backend rejected the operation; the item must stay queued
    Failed(String),
}

/// Per-item acknowledgment returned by an entity indexer
///
/// Items missing from the acknowledgment are treated as not applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchAcknowledgment {
    outcomes: HashMap<Uuid, ItemOutcome>,
}

impl BatchAcknowledgment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acknowledgment applying every item
    pub fn all_applied(items: &[QueueItem]) -> Self {
        let mut ack = Self::new();
        for item in items {
            ack.applied(item.id);
        }
        ack
    }

    pub fn applied(&mut self, id: Uuid) {
        self.outcomes.insert(id, ItemOutcome::Applied);
    }

    pub fn failed(&mut self, id: Uuid, reason: impl Into<String>) {
        self.outcomes.insert(id, ItemOutcome::Failed(reason.into()));
    }

    pub fn outcome(&self, id: &Uuid) -> Option<&ItemOutcome> {
        self.outcomes.get(id)
    }

    pub fn is_applied(&self, id: &Uuid) -> bool {
        matches!(self.outcomes.get(id), Some(ItemOutcome::Applied))
    }

    /// Split a batch into applied ids and failed items with reasons
    pub fn partition(&self, batch: &[QueueItem]) -> (Vec<Uuid>, Vec<(Uuid, String)>) {
        let mut applied = Vec::new();
        let mut failed = Vec::new();
        for item in batch {
            match self.outcomes.get(&item.id) {
                Some(ItemOutcome::Applied) => applied.push(item.id),
                Some(ItemOutcome::Failed(reason)) => failed.push((item.id, reason.clone())),
                None => failed.push((item.id, "not acknowledged by indexer".to_string())),
            }
        }
        (applied, failed)
    }
}

/// Summary of one `process_queue` run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessReport {
    /// Items acknowledged and deleted
    pub processed: usize,
    /// Items left queued for a later run
    pub failed: usize,
    /// Batches claimed
    pub batches: usize,
    /// Run stopped by cancellation or deadline before the queue was drained
    pub stopped_early: bool,
}

/// Pending items per entity type
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub entity_type: String,
    pub pending: i64,
    pub claimed: i64,
    pub retried: i64,
}
