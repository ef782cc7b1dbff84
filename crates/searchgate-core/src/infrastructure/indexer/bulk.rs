//! Bulk indexer
//!
//! Turns a claimed batch into one bulk request. Items targeting the same
//! document are collapsed onto the newest one, so a create followed by a
//! delete in the same batch only issues the delete. Non-delete items are
//! indexed from the current state reloaded through a [`DocumentLoader`];
//! instances that no longer exist are deleted instead.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::domain::queue::{BatchAcknowledgment, DocumentLoader, EntityIndexer, QueueItem};
use crate::domain::search::{
    BulkOperation, ENTITY_TYPE_FIELD, INSTANCE_NAME_FIELD, IndexCatalog, RetryPolicy,
    SearchBackend,
};
use crate::domain::security::Principal;
use crate::error::Result;

/// All queue items targeting one document, newest last
struct DocumentGroup<'a> {
    entity_type: &'a str,
    entity_id: &'a str,
    items: Vec<&'a QueueItem>,
}

impl<'a> DocumentGroup<'a> {
    fn newest(&self) -> &'a QueueItem {
        self.items[self.items.len() - 1]
    }

    fn ends_in_removal(&self) -> bool {
        self.newest().change_kind.is_removal()
    }
}

fn group_items(items: &[QueueItem]) -> Vec<DocumentGroup<'_>> {
    let mut groups: BTreeMap<(&str, &str), Vec<&QueueItem>> = BTreeMap::new();
    for item in items {
        groups.entry(item.document_key()).or_default().push(item);
    }
    groups
        .into_iter()
        .map(|((entity_type, entity_id), mut items)| {
            items.sort_by_key(|item| (item.created_at, item.id));
            DocumentGroup {
                entity_type,
                entity_id,
                items,
            }
        })
        .collect()
}

/// [`EntityIndexer`] writing documents to a [`SearchBackend`]
#[derive(Clone)]
pub struct BackendEntityIndexer {
    backend: Arc<dyn SearchBackend>,
    loader: Arc<dyn DocumentLoader>,
    catalog: IndexCatalog,
    retry: RetryPolicy,
}

impl fmt::Debug for BackendEntityIndexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendEntityIndexer")
            .field("backend", &self.backend.kind())
            .field("catalog", &self.catalog)
            .field("retry", &self.retry)
            .finish()
    }
}

impl BackendEntityIndexer {
    pub fn new(
        backend: Arc<dyn SearchBackend>,
        loader: Arc<dyn DocumentLoader>,
        catalog: IndexCatalog,
    ) -> Self {
        Self {
            backend,
            loader,
            catalog,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn is_indexed(&self, entity_type: &str) -> bool {
        self.catalog.entity_types().iter().any(|t| t == entity_type)
    }

    /// Load current documents for every group of one type that still needs indexing
    async fn load_type(
        &self,
        principal: &Principal,
        entity_type: &str,
        groups: &[&DocumentGroup<'_>],
    ) -> Result<HashMap<String, Value>> {
        let ids: Vec<String> = groups
            .iter()
            .filter(|g| !g.ends_in_removal())
            .map(|g| g.entity_id.to_string())
            .collect();
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        self.loader
            .load_documents(principal, entity_type, &ids)
            .await
    }
}

fn enrich(document: Value, group: &DocumentGroup<'_>) -> Value {
    let mut document = match document {
        Value::Object(map) => Value::Object(map),
        other => json!({ "value": other }),
    };
    if let Some(map) = document.as_object_mut() {
        map.insert(ENTITY_TYPE_FIELD.to_string(), json!(group.entity_type));
        if !map.contains_key(INSTANCE_NAME_FIELD)
            && let Some(name) = &group.newest().entity_name
        {
            map.insert(INSTANCE_NAME_FIELD.to_string(), json!(name));
        }
    }
    document
}

#[async_trait]
impl EntityIndexer for BackendEntityIndexer {
    async fn index_batch(
        &self,
        principal: &Principal,
        items: &[QueueItem],
    ) -> Result<BatchAcknowledgment> {
        let mut ack = BatchAcknowledgment::new();
        let groups = group_items(items);

        let mut by_type: BTreeMap<&str, Vec<&DocumentGroup<'_>>> = BTreeMap::new();
        for group in &groups {
            by_type.entry(group.entity_type).or_default().push(group);
        }

        let mut operations = Vec::with_capacity(groups.len());
        let mut targets: Vec<&DocumentGroup<'_>> = Vec::with_capacity(groups.len());

        for (entity_type, type_groups) in by_type {
            if !self.is_indexed(entity_type) {
                warn!(entity_type, "Queue items for a type without an index");
                for item in type_groups.iter().flat_map(|g| g.items.iter()) {
                    ack.failed(item.id, format!("entity type '{}' is not indexed", entity_type));
                }
                continue;
            }

            let mut documents = match self.load_type(principal, entity_type, &type_groups).await {
                Ok(documents) => documents,
                Err(e) => {
                    warn!(entity_type, error = %e, "Failed to load documents");
                    for item in type_groups.iter().flat_map(|g| g.items.iter()) {
                        ack.failed(item.id, format!("document load failed: {}", e));
                    }
                    continue;
                }
            };

            let index = self.catalog.index_for(entity_type);
            for group in type_groups {
                let document = if group.ends_in_removal() {
                    None
                } else {
                    documents.remove(group.entity_id)
                };
                operations.push(match document {
                    Some(document) => BulkOperation::Index {
                        index: index.clone(),
                        id: group.entity_id.to_string(),
                        document: enrich(document, group),
                    },
                    None => BulkOperation::Delete {
                        index: index.clone(),
                        id: group.entity_id.to_string(),
                    },
                });
                targets.push(group);
            }
        }

        if operations.is_empty() {
            return Ok(ack);
        }

        debug!(
            items = items.len(),
            operations = operations.len(),
            "Writing batch to search backend"
        );

        let ops = &operations;
        let results = self
            .retry
            .run("bulk", || self.backend.bulk(ops))
            .await?;

        for (group, result) in targets.iter().zip(results.iter()) {
            for item in &group.items {
                if result.is_success() {
                    ack.applied(item.id);
                } else {
                    let reason = result
                        .error
                        .clone()
                        .unwrap_or_else(|| format!("backend returned HTTP {}", result.status));
                    ack.failed(item.id, reason);
                }
            }
        }

        Ok(ack)
    }
}
