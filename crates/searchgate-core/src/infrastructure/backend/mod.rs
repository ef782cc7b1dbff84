//! Search backend clients

pub mod http;

pub use http::{DEFAULT_BASE_URL, HttpSearchBackend, HttpSearchBackendBuilder};
