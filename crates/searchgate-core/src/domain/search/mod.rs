//! Search domain module
//!
//! Paginated full-text search with row-level security applied after the
//! backend has ranked the hits.
//!
//! # Architecture
//!
//! - **Entities**: `SearchContext`, `SearchResult`, `SearchResultEntry`, `IndexCatalog`
//! - **Backend**: `SearchBackend` trait with Elasticsearch and OpenSearch variants
//! - **Strategies**: `SearchStrategy` implementations selected by name
//! - **Searcher**: `EntitySearcher` running the round-based compensation loop
//!
//! # Example
//!
//! ```ignore
//! use searchgate_core::domain::search::{EntitySearcher, SearchContext};
//! use searchgate_core::domain::security::Principal;
//!
//! let searcher = EntitySearcher::new(backend, policies, catalog);
//!
//! let context = SearchContext::new("acme", Principal::user("alice"))
//!     .with_entity_types(["sales_Order"])
//!     .with_page_size(20);
//! let page = searcher.search(context).await?;
//!
//! if page.more_data_available {
//!     let next = searcher.search_next_page(&page).await?;
//! }
//! ```

pub mod backend;
pub mod entity;
pub mod retry;
pub mod searcher;
pub mod strategy;

// Re-export main types
pub use backend::{BackendHealth, BackendKind, BulkItemResult, BulkOperation, SearchBackend};
pub use entity::{
    ENTITY_TYPE_FIELD, FieldHighlight, INSTANCE_NAME_FIELD, IndexCatalog, SearchContext,
    SearchHit, SearchRequest, SearchResponse, SearchResult, SearchResultEntry,
    is_index_name_safe,
};
pub use retry::RetryPolicy;
pub use searcher::{EntitySearcher, SearcherSettings};
pub use strategy::{
    AllTermsAnyField, AllTermsSingleField, AnyTermAnyField, HighlightTags, Phrase, RequestPage,
    SearchStrategy, StrategyRegistry,
};
