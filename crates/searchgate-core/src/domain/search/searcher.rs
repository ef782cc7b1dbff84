//! Secure entity searcher
//!
//! The index cannot enforce row-level access control, so every hit of a
//! restricted entity type is checked against a fresh secured reload before
//! it is shown. Rejected hits leave holes in a backend page; the searcher
//! keeps issuing rounds at the advancing offset until the page is full or
//! the backend runs out of hits.

use futures_util::future::try_join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::backend::SearchBackend;
use super::entity::{
    ENTITY_TYPE_FIELD, IndexCatalog, SearchContext, SearchHit, SearchRequest, SearchResponse,
    SearchResult, SearchResultEntry,
};
use super::retry::RetryPolicy;
use super::strategy::{HighlightTags, RequestPage, StrategyRegistry};
use crate::config::SearchConfig;
use crate::domain::security::{Principal, SecurityPolicyStore};
use crate::error::{Error, Result};

/// Searcher limits and presentation settings
#[derive(Debug, Clone)]
pub struct SearcherSettings {
    /// Cap on backend rounds per page
    pub max_rounds: u32,
    pub retry: RetryPolicy,
    pub highlight: HighlightTags,
}

impl Default for SearcherSettings {
    fn default() -> Self {
        Self::from(&SearchConfig::default())
    }
}

impl From<&SearchConfig> for SearcherSettings {
    fn from(config: &SearchConfig) -> Self {
        Self {
            max_rounds: config.max_rounds,
            retry: RetryPolicy {
                max_attempts: config.retry_max_attempts,
                base_backoff: Duration::from_millis(config.retry_backoff_ms),
                timeout: Duration::from_secs(config.request_timeout_secs),
            },
            highlight: HighlightTags {
                pre: config.highlight_pre_tag.clone(),
                post: config.highlight_post_tag.clone(),
            },
        }
    }
}

/// Visibility of one entity type within a round
enum Visibility {
    /// No row-level policies: every hit is accepted
    Trusted,
    /// Only these ids survived the secured reload
    Permitted(HashSet<String>),
}

/// Executes searches and filters hits through row-level policies
#[derive(Clone)]
pub struct EntitySearcher {
    backend: Arc<dyn SearchBackend>,
    policies: Arc<dyn SecurityPolicyStore>,
    strategies: StrategyRegistry,
    catalog: IndexCatalog,
    settings: SearcherSettings,
}

impl EntitySearcher {
    pub fn new(
        backend: Arc<dyn SearchBackend>,
        policies: Arc<dyn SecurityPolicyStore>,
        catalog: IndexCatalog,
    ) -> Self {
        Self {
            backend,
            policies,
            strategies: StrategyRegistry::builtin(),
            catalog,
            settings: SearcherSettings::default(),
        }
    }

    pub fn with_strategies(mut self, strategies: StrategyRegistry) -> Self {
        self.strategies = strategies;
        self
    }

    pub fn with_settings(mut self, settings: SearcherSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn strategies(&self) -> &StrategyRegistry {
        &self.strategies
    }

    pub fn catalog(&self) -> &IndexCatalog {
        &self.catalog
    }

    /// Search with the default strategy
    pub async fn search(&self, context: SearchContext) -> Result<SearchResult> {
        self.execute(context, None).await
    }

    /// Search with a named strategy
    pub async fn search_with_strategy(
        &self,
        context: SearchContext,
        strategy_name: &str,
    ) -> Result<SearchResult> {
        self.execute(context, Some(strategy_name)).await
    }

    /// Continue after `previous` with the same strategy
    pub async fn search_next_page(&self, previous: &SearchResult) -> Result<SearchResult> {
        self.execute(previous.next_context(), Some(&previous.strategy_name))
            .await
    }

    async fn execute(
        &self,
        context: SearchContext,
        strategy_name: Option<&str>,
    ) -> Result<SearchResult> {
        if context.page_size == 0 {
            return Err(Error::InvalidInput("page size must be positive".to_string()));
        }
        let strategy = self.strategies.resolve(strategy_name)?;
        let mut result = SearchResult::new(context, strategy.name());

        loop {
            if result.rounds >= self.settings.max_rounds {
                warn!(
                    rounds = result.rounds,
                    accepted = result.entries.len(),
                    offset = result.effective_offset,
                    total_hits = result.total_hits,
                    "Search round cap reached; returning partial page"
                );
                break;
            }

            let page = RequestPage {
                offset: result.effective_offset,
                size: result.context.page_size,
                highlight: &self.settings.highlight,
            };
            let Some(request) = strategy.build_request(&result.context, &self.catalog, &page)
            else {
                debug!(strategy = strategy.name(), "Nothing to search");
                break;
            };

            result.rounds += 1;
            let response = self.fetch(&request).await?;

            if response.shards_total == 0 {
                debug!(indices = ?request.indices, "No index in scope is available");
                break;
            }
            result.total_hits = response.total_hits;
            if response.hits.is_empty() {
                break;
            }

            let examined = self.accept_round(&response.hits, &mut result).await?;
            result.effective_offset += examined as u64;

            debug!(
                round = result.rounds,
                hits = response.hits.len(),
                examined,
                accepted = result.entries.len(),
                offset = result.effective_offset,
                total_hits = result.total_hits,
                "Search round finished"
            );

            if result.is_full() || result.remaining_hits() == 0 {
                break;
            }
        }

        result.more_data_available = result.remaining_hits() > 0;
        Ok(result)
    }

    async fn fetch(&self, request: &SearchRequest) -> Result<SearchResponse> {
        self.settings
            .retry
            .run("search", || self.backend.search(request))
            .await
    }

    /// Reconcile one round of hits and append the accepted ones in rank order
    ///
    /// Returns the number of hits examined, which stops at the hit that
    /// filled the page.
    async fn accept_round(&self, hits: &[SearchHit], result: &mut SearchResult) -> Result<usize> {
        let hit_types: Vec<Option<String>> = hits
            .iter()
            .map(|hit| self.entity_type_of(hit, &result.context))
            .collect();

        let mut ids_by_type: HashMap<&str, Vec<String>> = HashMap::new();
        for (hit, entity_type) in hits.iter().zip(&hit_types) {
            if let Some(entity_type) = entity_type {
                ids_by_type
                    .entry(entity_type.as_str())
                    .or_default()
                    .push(hit.id.clone());
            }
        }

        let principal = &result.context.principal;
        let visibility: HashMap<&str, Visibility> =
            try_join_all(ids_by_type.iter().map(|(entity_type, ids)| async move {
                let access = self.reconcile(principal, entity_type, ids).await?;
                Ok::<_, Error>((*entity_type, access))
            }))
            .await?
            .into_iter()
            .collect();

        let mut examined = 0;
        for (hit, entity_type) in hits.iter().zip(&hit_types) {
            if result.is_full() {
                break;
            }
            examined += 1;

            let Some(entity_type) = entity_type else {
                warn!(index = %hit.index, id = %hit.id, "Hit from an unknown index skipped");
                continue;
            };
            let accepted = match visibility.get(entity_type.as_str()) {
                Some(Visibility::Trusted) => true,
                Some(Visibility::Permitted(ids)) => ids.contains(&hit.id),
                None => false,
            };
            if accepted {
                result
                    .entries
                    .push(SearchResultEntry::from_hit(hit, entity_type));
            }
        }

        Ok(examined)
    }

    async fn reconcile(
        &self,
        principal: &Principal,
        entity_type: &str,
        ids: &[String],
    ) -> Result<Visibility> {
        let wrap = |e: Error| match e {
            Error::SecurityReload { .. } => e,
            other => Error::SecurityReload {
                entity_type: entity_type.to_string(),
                message: other.to_string(),
            },
        };

        let restricted = self
            .policies
            .has_row_level_policies(principal, entity_type)
            .await
            .map_err(wrap)?;
        if !restricted {
            return Ok(Visibility::Trusted);
        }

        let permitted = self
            .policies
            .reload_permitted(principal, entity_type, ids)
            .await
            .map_err(wrap)?;
        debug!(
            entity_type,
            hits = ids.len(),
            permitted = permitted.len(),
            "Reconciled hits against row-level policies"
        );
        Ok(Visibility::Permitted(permitted))
    }

    /// Entity type owning a hit: catalogue first, then the requested types,
    /// then the type stored in the document
    fn entity_type_of(&self, hit: &SearchHit, context: &SearchContext) -> Option<String> {
        if let Some(entity_type) = self.catalog.entity_type_for(&hit.index) {
            return Some(entity_type.to_string());
        }
        if let Some(entity_type) = context
            .entity_types
            .iter()
            .find(|t| self.catalog.index_for(t) == hit.index)
        {
            return Some(entity_type.clone());
        }
        hit.source
            .get(ENTITY_TYPE_FIELD)
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }
}

impl std::fmt::Debug for EntitySearcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntitySearcher")
            .field("backend", &self.backend.kind())
            .field("strategies", &self.strategies)
            .field("catalog", &self.catalog)
            .field("settings", &self.settings)
            .finish()
    }
}
