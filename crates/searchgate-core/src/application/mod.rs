//! Application layer
//!
//! Wires storage, the search backend and the domain services together from
//! a [`Config`](crate::config::Config).

pub mod runtime;

pub use runtime::Searchgate;
