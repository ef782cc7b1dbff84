//! SQL-backed entity sources and row-level policies
//!
//! Each `[[sources]]` entry maps an entity type onto a table. Table and
//! column names are validated identifiers; values are always bound.

pub mod policy;
pub mod source;

pub use policy::SqlPolicyStore;
pub use source::SqlTableSource;

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::SourceConfig;
use crate::domain::security::Principal;
use crate::error::{Error, Result};

/// Named parameter a row policy may use for the calling user's name
pub const PRINCIPAL_PARAM: &str = ":principal";

/// Validated source mappings keyed by entity type
#[derive(Debug, Clone)]
pub(crate) struct SourceTables {
    by_type: Arc<HashMap<String, SourceConfig>>,
}

impl SourceTables {
    pub(crate) fn new(sources: &[SourceConfig]) -> Result<Self> {
        let mut by_type = HashMap::with_capacity(sources.len());
        for source in sources {
            source
                .validate()
                .map_err(|e| Error::ConfigError(e.to_string()))?;
            if by_type
                .insert(source.entity_type.clone(), source.clone())
                .is_some()
            {
                return Err(Error::ConfigError(format!(
                    "Entity type '{}' is configured more than once",
                    source.entity_type
                )));
            }
        }
        Ok(Self {
            by_type: Arc::new(by_type),
        })
    }

    pub(crate) fn get(&self, entity_type: &str) -> Result<&SourceConfig> {
        self.by_type
            .get(entity_type)
            .ok_or_else(|| Error::UnknownEntityType(entity_type.to_string()))
    }
}

/// Row policy as an SQL fragment plus its bound principal names
///
/// `System` and unrestricted sources get no fragment.
pub(crate) fn policy_clause(source: &SourceConfig, principal: &Principal) -> Option<(String, usize)> {
    if principal.is_system() {
        return None;
    }
    let predicate = source.row_policy.as_deref()?;
    let binds = predicate.matches(PRINCIPAL_PARAM).count();
    Some((
        format!("({})", predicate.replace(PRINCIPAL_PARAM, "?")),
        binds,
    ))
}

/// Double-quote a validated identifier
pub(crate) fn quote(ident: &str) -> String {
    format!("\"{}\"", ident)
}

/// SQLite's default host parameter limit is well above this
pub(crate) const MAX_IDS_PER_QUERY: usize = 500;
