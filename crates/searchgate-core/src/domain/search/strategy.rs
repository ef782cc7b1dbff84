//! Search strategies
//!
//! A strategy decides which indices a search covers and how the query text
//! becomes a backend query. Strategies are looked up by name.

use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::entity::{IndexCatalog, SearchContext, SearchRequest};
use crate::error::{Error, Result};

pub const ANY_TERM_ANY_FIELD: &str = "any_term_any_field";
pub const ALL_TERMS_ANY_FIELD: &str = "all_terms_any_field";
pub const ALL_TERMS_SINGLE_FIELD: &str = "all_terms_single_field";
pub const PHRASE: &str = "phrase";

/// Highlight markers wrapped around matched spans
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HighlightTags {
    pub pre: String,
    pub post: String,
}

impl Default for HighlightTags {
    fn default() -> Self {
        Self {
            pre: "<b>".to_string(),
            post: "</b>".to_string(),
        }
    }
}

/// Window of raw hits a single backend round asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPage<'a> {
    pub offset: u64,
    pub size: u32,
    pub highlight: &'a HighlightTags,
}

/// Shapes backend requests for a search context
pub trait SearchStrategy: Send + Sync {
    /// Registry name
    fn name(&self) -> &str;

    /// Backend query for the query text
    fn query(&self, text: &str) -> Value;

    /// Indices the context covers; all catalogued types when none are given
    fn scope(&self, context: &SearchContext, catalog: &IndexCatalog) -> Vec<String> {
        let types = if context.entity_types.is_empty() {
            catalog.entity_types()
        } else {
            context.entity_types.as_slice()
        };
        let mut indices: Vec<String> = Vec::with_capacity(types.len());
        for index in types.iter().map(|t| catalog.index_for(t)) {
            if !indices.contains(&index) {
                indices.push(index);
            }
        }
        indices
    }

    /// Full request for one round, or `None` when there is nothing to search
    fn build_request(
        &self,
        context: &SearchContext,
        catalog: &IndexCatalog,
        page: &RequestPage<'_>,
    ) -> Option<SearchRequest> {
        let text = context.query_text.trim();
        if text.is_empty() {
            return None;
        }
        let indices = self.scope(context, catalog);
        if indices.is_empty() {
            return None;
        }

        Some(SearchRequest {
            indices,
            body: json!({
                "from": page.offset,
                "size": page.size,
                "track_total_hits": true,
                "query": self.query(text),
                "highlight": {
                    "require_field_match": true,
                    "pre_tags": [page.highlight.pre],
                    "post_tags": [page.highlight.post],
                    "fields": { "*": {} }
                }
            }),
        })
    }
}

fn multi_match(text: &str, kind: &str, operator: Option<&str>) -> Value {
    let mut body = json!({
        "query": text,
        "fields": ["*"],
        "type": kind,
    });
    if let Some(operator) = operator {
        body["operator"] = json!(operator);
    }
    json!({ "multi_match": body })
}

/// Matches documents containing any term in any field
#[derive(Debug, Clone, Copy, Default)]
pub struct AnyTermAnyField;

impl SearchStrategy for AnyTermAnyField {
    fn name(&self) -> &str {
        ANY_TERM_ANY_FIELD
    }

    fn query(&self, text: &str) -> Value {
        multi_match(text, "best_fields", Some("or"))
    }
}

/// Every term must appear, possibly spread across fields
#[derive(Debug, Clone, Copy, Default)]
pub struct AllTermsAnyField;

impl SearchStrategy for AllTermsAnyField {
    fn name(&self) -> &str {
        ALL_TERMS_ANY_FIELD
    }

    fn query(&self, text: &str) -> Value {
        multi_match(text, "cross_fields", Some("and"))
    }
}

/// Every term must appear within one field
#[derive(Debug, Clone, Copy, Default)]
pub struct AllTermsSingleField;

impl SearchStrategy for AllTermsSingleField {
    fn name(&self) -> &str {
        ALL_TERMS_SINGLE_FIELD
    }

    fn query(&self, text: &str) -> Value {
        multi_match(text, "best_fields", Some("and"))
    }
}

/// Exact phrase in any field
#[derive(Debug, Clone, Copy, Default)]
pub struct Phrase;

impl SearchStrategy for Phrase {
    fn name(&self) -> &str {
        PHRASE
    }

    fn query(&self, text: &str) -> Value {
        multi_match(text, "phrase", None)
    }
}

/// Strategies by name, with a default
#[derive(Clone)]
pub struct StrategyRegistry {
    strategies: BTreeMap<String, Arc<dyn SearchStrategy>>,
    default: String,
}

impl StrategyRegistry {
    /// Registry without any strategy
    pub fn empty(default: impl Into<String>) -> Self {
        Self {
            strategies: BTreeMap::new(),
            default: default.into(),
        }
    }

    /// Registry with the four built-in strategies and `any_term_any_field` as default
    pub fn builtin() -> Self {
        let mut registry = Self::empty(ANY_TERM_ANY_FIELD);
        registry.register(Arc::new(AnyTermAnyField));
        registry.register(Arc::new(AllTermsAnyField));
        registry.register(Arc::new(AllTermsSingleField));
        registry.register(Arc::new(Phrase));
        registry
    }

    /// Add or replace a strategy under its own name
    pub fn register(&mut self, strategy: Arc<dyn SearchStrategy>) {
        self.strategies.insert(strategy.name().to_string(), strategy);
    }

    /// Change the default strategy; it must be registered
    pub fn with_default(mut self, name: &str) -> Result<Self> {
        if !self.strategies.contains_key(name) {
            return Err(Error::UnknownStrategy(name.to_string()));
        }
        self.default = name.to_string();
        Ok(self)
    }

    pub fn default_name(&self) -> &str {
        &self.default
    }

    /// Strategy by name, or the default when `name` is `None`
    pub fn resolve(&self, name: Option<&str>) -> Result<Arc<dyn SearchStrategy>> {
        let name = name.unwrap_or(&self.default);
        self.strategies
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownStrategy(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.strategies.keys().map(String::as_str).collect()
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrategyRegistry")
            .field("strategies", &self.names())
            .field("default", &self.default)
            .finish()
    }
}
