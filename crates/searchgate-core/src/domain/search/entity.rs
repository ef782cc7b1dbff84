//! Search entity and related types
//!
//! Defines the per-call context, the result accumulator and the
//! backend-neutral request/response shapes the searcher works with.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::domain::security::Principal;
use crate::error::{Error, Result};

/// Source field holding a document's display name
pub const INSTANCE_NAME_FIELD: &str = "_instance_name";

/// Source field holding a document's entity type
pub const ENTITY_TYPE_FIELD: &str = "_entity_type";

/// Immutable input of one search call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchContext {
    /// Entity types in scope (empty = every known type)
    pub entity_types: Vec<String>,
    pub query_text: String,
    pub page_size: u32,
    /// Raw backend hits to skip
    pub offset: u64,
    /// Identity whose row-level policies apply
    pub principal: Principal,
}

impl SearchContext {
    /// Create a context for `query_text` with a page size of 10
    pub fn new(query_text: impl Into<String>, principal: Principal) -> Self {
        Self {
            entity_types: Vec::new(),
            query_text: query_text.into(),
            page_size: 10,
            offset: 0,
            principal,
        }
    }

    pub fn with_entity_types<I, S>(mut self, entity_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entity_types = entity_types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    /// Copy of this context continuing at `offset`
    pub fn continued_at(&self, offset: u64) -> Self {
        Self {
            offset,
            ..self.clone()
        }
    }
}

/// Highlighted fragments of one document field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldHighlight {
    pub field: String,
    pub fragments: Vec<String>,
}

/// One accepted hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResultEntry {
    pub id: String,
    /// Stored display name, or the id when the document has none
    pub display_name: String,
    pub entity_type: String,
    pub highlights: Vec<FieldHighlight>,
}

impl SearchResultEntry {
    /// Build an entry from a raw hit
    pub fn from_hit(hit: &SearchHit, entity_type: &str) -> Self {
        let display_name = hit
            .source
            .get(INSTANCE_NAME_FIELD)
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| hit.id.clone());

        let mut highlights: Vec<_> = hit
            .highlight
            .iter()
            .map(|(field, fragments)| FieldHighlight {
                field: field.clone(),
                fragments: fragments.clone(),
            })
            .collect();
        highlights.sort_by(|a, b| a.field.cmp(&b.field));

        Self {
            id: hit.id.clone(),
            display_name,
            entity_type: entity_type.to_string(),
            highlights,
        }
    }
}

/// Accumulated outcome of a search call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub entries: Vec<SearchResultEntry>,
    /// Total raw hits reported by the backend
    pub total_hits: u64,
    /// Raw hits examined so far; the cursor for the next page
    pub effective_offset: u64,
    pub more_data_available: bool,
    pub strategy_name: String,
    pub context: SearchContext,
    /// Backend rounds issued for this page
    pub rounds: u32,
}

impl SearchResult {
    /// Empty result starting at the context's offset
    pub fn new(context: SearchContext, strategy_name: impl Into<String>) -> Self {
        Self {
            entries: Vec::new(),
            total_hits: 0,
            effective_offset: context.offset,
            more_data_available: false,
            strategy_name: strategy_name.into(),
            context,
            rounds: 0,
        }
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.context.page_size as usize
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Raw hits not yet examined
    pub fn remaining_hits(&self) -> u64 {
        self.total_hits.saturating_sub(self.effective_offset)
    }

    /// Context for the following page
    pub fn next_context(&self) -> SearchContext {
        self.context.continued_at(self.effective_offset)
    }
}

/// Backend-native request produced by a strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub indices: Vec<String>,
    pub body: Value,
}

/// One raw backend hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub index: String,
    pub id: String,
    pub score: Option<f64>,
    pub source: Value,
    pub highlight: HashMap<String, Vec<String>>,
}

/// Raw backend response
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SearchResponse {
    pub total_hits: u64,
    pub hits: Vec<SearchHit>,
    /// Shards the request reached; zero means no index in scope exists
    pub shards_total: u32,
}

impl SearchResponse {
    /// Parse an Elasticsearch/OpenSearch `_search` response body
    pub fn from_json(body: &Value) -> Result<Self> {
        let hits_obj = body
            .get("hits")
            .ok_or_else(|| Error::SearchFailed("response has no 'hits' section".to_string()))?;

        // `total` is an object since ES 7, a bare number before
        let total_hits = match hits_obj.get("total") {
            Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
            Some(total) => total.get("value").and_then(Value::as_u64).unwrap_or(0),
            None => 0,
        };

        let shards_total = body
            .get("_shards")
            .and_then(|s| s.get("total"))
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;

        let hits = hits_obj
            .get("hits")
            .and_then(Value::as_array)
            .map(|hits| hits.iter().map(parse_hit).collect::<Result<Vec<_>>>())
            .transpose()?
            .unwrap_or_default();

        Ok(Self {
            total_hits,
            hits,
            shards_total,
        })
    }
}

fn parse_hit(hit: &Value) -> Result<SearchHit> {
    let index = hit
        .get("_index")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::SearchFailed("hit without '_index'".to_string()))?;
    let id = hit
        .get("_id")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::SearchFailed("hit without '_id'".to_string()))?;

    let highlight = match hit.get("highlight") {
        Some(value) => serde_json::from_value(value.clone())?,
        None => HashMap::new(),
    };

    Ok(SearchHit {
        index: index.to_string(),
        id: id.to_string(),
        score: hit.get("_score").and_then(Value::as_f64),
        source: hit.get("_source").cloned().unwrap_or(Value::Null),
        highlight,
    })
}

/// Characters search engines refuse in index names, plus URL delimiters
const INDEX_NAME_FORBIDDEN: &[char] = &['\\', '/', '*', '?', '"', '<', '>', '|', ',', '#', ':', '%', ' '];

/// Whether `name` can be used as an index name in a request path
pub fn is_index_name_safe(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with(['_', '-', '+'])
        && name != "."
        && name != ".."
        && !name.chars().any(|c| c.is_control() || INDEX_NAME_FORBIDDEN.contains(&c))
}

/// Maps entity types to index names and back
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexCatalog {
    prefix: String,
    by_index: HashMap<String, String>,
    entity_types: Vec<String>,
}

impl IndexCatalog {
    pub fn new<I, S>(prefix: impl Into<String>, entity_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut catalog = Self {
            prefix: prefix.into(),
            by_index: HashMap::new(),
            entity_types: Vec::new(),
        };
        for entity_type in entity_types {
            catalog.register(entity_type);
        }
        catalog
    }

    /// Add an entity type
    pub fn register(&mut self, entity_type: impl Into<String>) {
        let entity_type = entity_type.into();
        if self.entity_types.contains(&entity_type) {
            return;
        }
        self.by_index
            .insert(self.index_for(&entity_type), entity_type.clone());
        self.entity_types.push(entity_type);
    }

    /// Index holding documents of `entity_type`
    pub fn index_for(&self, entity_type: &str) -> String {
        format!("{}{}", self.prefix, entity_type.to_lowercase())
    }

    /// Entity type stored in `index`, if registered
    pub fn entity_type_for(&self, index: &str) -> Option<&str> {
        self.by_index.get(index).map(String::as_str)
    }

    /// Registered entity types in registration order
    pub fn entity_types(&self) -> &[String] {
        &self.entity_types
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_index_name_safety() {
        assert!(is_index_name_safe("search_index_sales_order"));
        assert!(is_index_name_safe("orders.v2"));
        for name in ["", "_all", "-x", "a/b", "a#b", "a?b", "a,b", "a b", "a%2Fb", ".."] {
            assert!(!is_index_name_safe(name), "{name:?} should be rejected");
        }
    }

    #[test]
    fn test_context_continuation() {
        let context = SearchContext::new("acme", Principal::user("bob"))
            .with_entity_types(["sales_Order"])
            .with_page_size(5);
        let next = context.continued_at(12);

        assert_eq!(next.offset, 12);
        assert_eq!(next.page_size, 5);
        assert_eq!(next.entity_types, vec!["sales_Order".to_string()]);
        assert_eq!(context.offset, 0);
    }

    #[test]
    fn test_parse_search_response() {
        let body = json!({
            "_shards": { "total": 2, "successful": 2 },
            "hits": {
                "total": { "value": 42, "relation": "eq" },
                "hits": [
                    {
                        "_index": "search_index_sales_order",
                        "_id": "7",
                        "_score": 1.5,
                        "_source": { "_instance_name": "Order #7" },
                        "highlight": { "number": ["<b>7</b>"] }
                    }
                ]
            }
        });

        let response = SearchResponse::from_json(&body).unwrap();
        assert_eq!(response.total_hits, 42);
        assert_eq!(response.shards_total, 2);
        assert_eq!(response.hits.len(), 1);
        assert_eq!(response.hits[0].id, "7");
        assert_eq!(response.hits[0].highlight["number"], vec!["<b>7</b>"]);
    }

    #[test]
    fn test_parse_legacy_total_and_missing_hits() {
        let legacy = json!({ "_shards": { "total": 1 }, "hits": { "total": 3, "hits": [] } });
        assert_eq!(SearchResponse::from_json(&legacy).unwrap().total_hits, 3);

        let broken = json!({ "error": "nope" });
        assert!(matches!(
            SearchResponse::from_json(&broken),
            Err(Error::SearchFailed(_))
        ));
    }

    #[test]
    fn test_entry_display_name_falls_back_to_id() {
        let hit = SearchHit {
            index: "i".into(),
            id: "123".into(),
            score: None,
            source: json!({}),
            highlight: HashMap::from([
                ("b".to_string(), vec!["x".to_string()]),
                ("a".to_string(), vec!["y".to_string()]),
            ]),
        };

        let entry = SearchResultEntry::from_hit(&hit, "sales_Order");
        assert_eq!(entry.display_name, "123");
        assert_eq!(entry.highlights[0].field, "a");

        let named = SearchHit {
            source: json!({ "_instance_name": "Order #123" }),
            ..hit
        };
        assert_eq!(SearchResultEntry::from_hit(&named, "sales_Order").display_name, "Order #123");
    }

    #[test]
    fn test_index_catalog() {
        let mut catalog = IndexCatalog::new("search_index_", ["sales_Order"]);
        catalog.register("sales_Customer");
        catalog.register("sales_Order");

        assert_eq!(catalog.index_for("sales_Order"), "search_index_sales_order");
        assert_eq!(
            catalog.entity_type_for("search_index_sales_customer"),
            Some("sales_Customer")
        );
        assert_eq!(catalog.entity_type_for("other"), None);
        assert_eq!(catalog.entity_types().len(), 2);
    }

    #[test]
    fn test_result_cursor() {
        let context = SearchContext::new("q", Principal::system()).with_offset(20);
        let mut result = SearchResult::new(context, "phrase");
        assert_eq!(result.effective_offset, 20);

        result.total_hits = 35;
        result.effective_offset = 30;
        assert_eq!(result.remaining_hits(), 5);
        assert_eq!(result.next_context().offset, 30);
        assert!(!result.is_full());
    }
}
