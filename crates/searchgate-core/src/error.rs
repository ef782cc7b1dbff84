//! Error types for Searchgate

use thiserror::Error;

/// Result type alias using Searchgate's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Searchgate error types with helpful messages and suggestions
#[derive(Error, Debug)]
pub enum Error {
    // Queue errors (E001-E099)
    #[error("Unknown change kind '{0}'. Expected CREATED, UPDATED or DELETED.")]
    InvalidChangeKind(String),

    #[error("No entity source configured for '{0}'. Add a [[sources]] entry to the configuration.")]
    UnknownEntityType(String),

    #[error("Entity indexer failed: {0}")]
    IndexingFailed(String),

    // Search errors (E100-E199)
    #[error("Search failed: {0}")]
    SearchFailed(String),

    #[error("Search strategy '{0}' is not registered.")]
    UnknownStrategy(String),

    #[error("Search backend unavailable (HTTP {status}): {message}")]
    BackendUnavailable { status: u16, message: String },

    #[error("Search request timed out after {0} ms")]
    SearchTimeout(u64),

    #[error("Network error: {0}. Check that the search backend is reachable.")]
    NetworkError(#[from] reqwest::Error),

    // Security errors (E200-E299)
    #[error("Secured reload of '{entity_type}' failed: {message}")]
    SecurityReload { entity_type: String, message: String },

    // Lock errors (E300-E399)
    #[error("Lease '{0}' is held by another worker.")]
    LeaseHeld(String),

    // Database errors (E400-E499)
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    // Config errors (E600-E699)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // Cancellation (E700-E799)
    #[error("Operation cancelled")]
    Cancelled,

    // Input errors (E800-E899)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic errors
    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidChangeKind(_) => "E001",
            Self::UnknownEntityType(_) => "E002",
            Self::IndexingFailed(_) => "E003",
            Self::SearchFailed(_) => "E100",
            Self::UnknownStrategy(_) => "E101",
            Self::BackendUnavailable { .. } => "E102",
            Self::SearchTimeout(_) => "E103",
            Self::NetworkError(_) => "E104",
            Self::SecurityReload { .. } => "E200",
            Self::LeaseHeld(_) => "E300",
            Self::DatabaseError(_) => "E400",
            Self::ConfigError(_) => "E600",
            Self::Cancelled => "E700",
            Self::InvalidInput(_) => "E800",
            Self::Serialization(_) => "E801",
            Self::Other(_) | Self::Io(_) => "E9999",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::UnknownEntityType(_) => Some("searchgate config list".to_string()),
            Self::UnknownStrategy(_) => Some(
                "Use one of: any_term_any_field, all_terms_any_field, all_terms_single_field, phrase"
                    .to_string(),
            ),
            Self::BackendUnavailable { .. } | Self::NetworkError(_) | Self::SearchTimeout(_) => {
                Some("searchgate doctor".to_string())
            }
            Self::SecurityReload { .. } => Some("Retry the search".to_string()),
            Self::LeaseHeld(name) => Some(format!(
                "Another worker owns '{}'. Wait for its lease to expire.",
                name
            )),
            _ => None,
        }
    }

    /// Whether a retry of the same request may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::BackendUnavailable { status, .. } => matches!(status, 429 | 502 | 503 | 504),
            Self::NetworkError(e) => e.is_timeout() || e.is_connect(),
            Self::SearchTimeout(_) => true,
            _ => false,
        }
    }
}
