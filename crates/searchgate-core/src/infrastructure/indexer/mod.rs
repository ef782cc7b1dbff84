//! Entity indexer backed by a search backend

pub mod bulk;

pub use bulk::BackendEntityIndexer;
