//! Infrastructure layer
//!
//! Implementations of the domain seams for external systems: the search
//! backend over HTTP and the SQL tables entities are loaded from.

pub mod backend;
pub mod indexer;
pub mod sql;
