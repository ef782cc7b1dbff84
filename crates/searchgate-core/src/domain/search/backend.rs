//! Search backend seam
//!
//! Elasticsearch and OpenSearch are two variants of the same contract,
//! selected by [`BackendKind`] at startup.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use super::entity::{SearchRequest, SearchResponse};
use crate::error::Result;

/// Supported search engines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Elasticsearch,
    OpenSearch,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Elasticsearch => "elasticsearch",
            Self::OpenSearch => "opensearch",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "elasticsearch" | "es" => Ok(Self::Elasticsearch),
            "opensearch" | "os" => Ok(Self::OpenSearch),
            other => Err(format!(
                "unknown backend '{}', expected elasticsearch or opensearch",
                other
            )),
        }
    }
}

/// One operation of a bulk request
#[derive(Debug, Clone, PartialEq)]
pub enum BulkOperation {
    /// Upsert a full document by id
    Index {
        index: String,
        id: String,
        document: Value,
    },
    /// Remove a document by id
    Delete { index: String, id: String },
}

impl BulkOperation {
    pub fn index(&self) -> &str {
        match self {
            Self::Index { index, .. } | Self::Delete { index, .. } => index,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Index { id, .. } | Self::Delete { id, .. } => id,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, Self::Delete { .. })
    }
}

/// Outcome of one bulk operation, in request order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkItemResult {
    pub index: String,
    pub id: String,
    pub status: u16,
    /// `not_found` result on a delete
    pub not_found: bool,
    pub error: Option<String>,
}

impl BulkItemResult {
    /// Whether the operation left the document in the requested state
    ///
    /// Deleting a document that is already gone counts as success.
    pub fn is_success(&self) -> bool {
        self.error.is_none() && ((200..300).contains(&self.status) || self.not_found)
    }
}

/// Result of a backend health probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendHealth {
    pub kind: BackendKind,
    pub cluster_name: Option<String>,
    pub version: Option<String>,
    /// Distribution reported by the server (`opensearch` or absent for ES)
    pub distribution: Option<String>,
}

impl BackendHealth {
    /// Whether the server is the distribution the client was configured for
    pub fn matches_kind(&self) -> bool {
        match self.kind {
            BackendKind::OpenSearch => self.distribution.as_deref() == Some("opensearch"),
            BackendKind::Elasticsearch => self.distribution.as_deref() != Some("opensearch"),
        }
    }
}

/// A full-text search engine
#[async_trait]
pub trait SearchBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Execute a search request
    async fn search(&self, request: &SearchRequest) -> Result<SearchResponse>;

    /// Apply operations in one bulk call, returning one result per operation
    async fn bulk(&self, operations: &[BulkOperation]) -> Result<Vec<BulkItemResult>>;

    /// Probe the server
    async fn health(&self) -> Result<BackendHealth>;
}
