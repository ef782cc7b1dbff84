//! Row-level policy seam used by the searcher
//!
//! The search index knows nothing about row-level access control. Before a hit
//! of a restricted entity type is shown, its id is reloaded through
//! [`SecurityPolicyStore::reload_permitted`], which only returns ids the
//! principal may see.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::principal::Principal;
use crate::error::Result;

/// Row-level access control for entity instances
#[async_trait]
pub trait SecurityPolicyStore: Send + Sync {
    /// Whether instances of `entity_type` are filtered for this principal
    async fn has_row_level_policies(&self, principal: &Principal, entity_type: &str)
    -> Result<bool>;

    /// Reload `ids` under the principal's policies, returning the permitted subset
    ///
    /// Ids that no longer exist are not returned either.
    async fn reload_permitted(
        &self,
        principal: &Principal,
        entity_type: &str,
        ids: &[String],
    ) -> Result<HashSet<String>>;
}

/// Predicate deciding whether a principal may see one instance
pub type RowPredicate = Arc<dyn Fn(&Principal, &str) -> bool + Send + Sync>;

/// Policy store holding predicates in memory
///
/// An instance is visible when every predicate registered for its type
/// accepts it. `System` bypasses all predicates.
#[derive(Clone, Default)]
pub struct InMemoryPolicyStore {
    policies: HashMap<String, Vec<RowPredicate>>,
    removed: HashMap<String, HashSet<String>>,
    reloads: Arc<AtomicUsize>,
}

impl InMemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a row-level predicate for an entity type
    pub fn with_policy<F>(mut self, entity_type: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&Principal, &str) -> bool + Send + Sync + 'static,
    {
        self.policies
            .entry(entity_type.into())
            .or_default()
            .push(Arc::new(predicate));
        self
    }

    /// Mark an instance as deleted from the source of truth
    pub fn with_removed(mut self, entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        self.removed
            .entry(entity_type.into())
            .or_default()
            .insert(id.into());
        self
    }

    /// Number of secured reloads performed so far
    pub fn reload_count(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for InMemoryPolicyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryPolicyStore")
            .field("restricted_types", &self.policies.keys().collect::<Vec<_>>())
            .field("reloads", &self.reload_count())
            .finish()
    }
}

#[async_trait]
impl SecurityPolicyStore for InMemoryPolicyStore {
    async fn has_row_level_policies(
        &self,
        principal: &Principal,
        entity_type: &str,
    ) -> Result<bool> {
        if principal.is_system() {
            return Ok(false);
        }
        Ok(self
            .policies
            .get(entity_type)
            .is_some_and(|predicates| !predicates.is_empty()))
    }

    async fn reload_permitted(
        &self,
        principal: &Principal,
        entity_type: &str,
        ids: &[String],
    ) -> Result<HashSet<String>> {
        self.reloads.fetch_add(1, Ordering::SeqCst);

        let removed = self.removed.get(entity_type);
        let predicates = self.policies.get(entity_type);

        Ok(ids
            .iter()
            .filter(|id| !removed.is_some_and(|r| r.contains(id.as_str())))
            .filter(|id| {
                principal.is_system()
                    || predicates.is_none_or(|preds| preds.iter().all(|p| p(principal, id)))
            })
            .cloned()
            .collect())
    }
}
