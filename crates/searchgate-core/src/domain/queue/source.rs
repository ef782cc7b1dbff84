//! Read access to the source of truth for indexed entities

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

use super::entity::EntityRef;
use crate::domain::security::Principal;
use crate::error::Result;

/// Enumerates existing instances of an entity type for full reindexing
#[async_trait]
pub trait EntitySource: Send + Sync {
    /// Load up to `limit` instances ordered by id, strictly after `after_id`
    async fn load_refs(
        &self,
        principal: &Principal,
        entity_type: &str,
        after_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<EntityRef>>;
}

/// Loads the current state of instances as backend documents
#[async_trait]
pub trait DocumentLoader: Send + Sync {
    /// Documents keyed by id; ids that no longer exist are absent
    async fn load_documents(
        &self,
        principal: &Principal,
        entity_type: &str,
        ids: &[String],
    ) -> Result<HashMap<String, Value>>;
}
