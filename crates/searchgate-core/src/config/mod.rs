//! Configuration management with file persistence

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::PathBuf;

use crate::domain::search::{BackendKind, is_index_name_safe};
use crate::storage::is_sql_identifier;

/// Environment variable overriding the configuration directory
pub const CONFIG_DIR_ENV: &str = "SEARCHGATE_CONFIG_DIR";

/// Environment variable holding the search backend password
pub const BACKEND_PASSWORD_ENV: &str = "SEARCHGATE_BACKEND_PASSWORD";

/// Searchgate configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseSettings,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub search: SearchConfig,
    /// Entity types that can be reindexed, loaded for indexing and row-filtered
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// Database file (defaults to `<config_dir>/searchgate.db`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    pub max_connections: u32,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: None,
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub batch_size: u32,
    pub max_processed_per_execution: u32,
    /// Fixed delay between scheduler ticks
    pub interval_secs: u64,
    /// TTL of the drain lease held for the duration of a tick
    pub lease_ttl_secs: u64,
    /// How long a claimed batch stays invisible to other workers
    pub claim_ttl_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_processed_per_execution: 1000,
            interval_secs: 5,
            lease_ttl_secs: 300,
            claim_ttl_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub backend: BackendKind,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Must stay empty; the password comes from `SEARCHGATE_BACKEND_PASSWORD`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub index_prefix: String,
    pub default_strategy: String,
    pub highlight_pre_tag: String,
    pub highlight_post_tag: String,
    pub page_size: u32,
    pub max_rounds: u32,
    pub request_timeout_secs: u64,
    pub retry_max_attempts: u32,
    pub retry_backoff_ms: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Elasticsearch,
            url: "http://localhost:9200".to_string(),
            username: None,
            password: None,
            index_prefix: "search_index_".to_string(),
            default_strategy: "any_term_any_field".to_string(),
            highlight_pre_tag: "<b>".to_string(),
            highlight_post_tag: "</b>".to_string(),
            page_size: 10,
            max_rounds: 10,
            request_timeout_secs: 30,
            retry_max_attempts: 3,
            retry_backoff_ms: 200,
        }
    }
}

/// Maps an entity type onto the SQL table holding its rows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub entity_type: String,
    pub table: String,
    #[serde(default = "default_id_column")]
    pub id_column: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_column: Option<String>,
    /// Text columns copied into the indexed document
    #[serde(default)]
    pub fields: Vec<String>,
    /// SQL predicate a row must satisfy to be visible to non-system principals
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_policy: Option<String>,
}

fn default_id_column() -> String {
    "id".to_string()
}

impl SourceConfig {
    pub fn new(entity_type: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            table: table.into(),
            id_column: default_id_column(),
            name_column: None,
            fields: Vec::new(),
            row_policy: None,
        }
    }

    pub fn with_name_column(mut self, column: impl Into<String>) -> Self {
        self.name_column = Some(column.into());
        self
    }

    pub fn with_fields(mut self, fields: &[&str]) -> Self {
        self.fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn with_row_policy(mut self, predicate: impl Into<String>) -> Self {
        self.row_policy = Some(predicate.into());
        self
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let mut columns = vec![&self.table, &self.id_column];
        columns.extend(self.name_column.iter());
        columns.extend(self.fields.iter());
        for ident in columns {
            if !is_sql_identifier(ident) {
                return Err(anyhow!(
                    "Invalid SQL identifier '{}' in source '{}'",
                    ident,
                    self.entity_type
                ));
            }
        }
        if self.entity_type.trim().is_empty() {
            return Err(anyhow!("Source entity_type must not be empty"));
        }
        if !is_index_name_safe(&self.entity_type.to_lowercase()) {
            return Err(anyhow!(
                "Source entity_type '{}' cannot be used in an index name",
                self.entity_type
            ));
        }
        Ok(())
    }
}

impl SearchConfig {
    pub fn resolved_password(&self) -> anyhow::Result<Option<String>> {
        self.enforce_env_only()?;
        Ok(env::var(BACKEND_PASSWORD_ENV).ok())
    }

    pub fn enforce_env_only(&self) -> anyhow::Result<()> {
        if self.password.is_some() {
            return Err(anyhow!(
                "Backend passwords must be provided via {}, not stored in configuration",
                BACKEND_PASSWORD_ENV
            ));
        }
        Ok(())
    }
}

const KEYS: &[&str] = &[
    "database.path",
    "database.max_connections",
    "queue.batch_size",
    "queue.max_processed_per_execution",
    "queue.interval_secs",
    "queue.lease_ttl_secs",
    "queue.claim_ttl_secs",
    "search.backend",
    "search.url",
    "search.username",
    "search.password",
    "search.index_prefix",
    "search.default_strategy",
    "search.highlight_pre_tag",
    "search.highlight_post_tag",
    "search.page_size",
    "search.max_rounds",
    "search.request_timeout_secs",
    "search.retry_max_attempts",
    "search.retry_backoff_ms",
];

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var(CONFIG_DIR_ENV) {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("searchgate")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Resolve the queue database path
    pub fn database_path(&self) -> anyhow::Result<PathBuf> {
        match &self.database.path {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::config_dir()?.join("searchgate.db")),
        }
    }

    /// Load configuration from file, or the defaults if it doesn't exist
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path()?;

        if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config = Self::from_toml(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> anyhow::Result<()> {
        self.validate()?;

        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;

        let path = Self::config_path()?;
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        self.search.enforce_env_only()?;

        if self.queue.batch_size == 0 {
            return Err(anyhow!("queue.batch_size must be greater than 0"));
        }
        if self.queue.max_processed_per_execution == 0 {
            return Err(anyhow!("queue.max_processed_per_execution must be greater than 0"));
        }
        if self.queue.lease_ttl_secs == 0 || self.queue.claim_ttl_secs == 0 {
            return Err(anyhow!("queue lease and claim TTLs must be greater than 0"));
        }
        if self.search.page_size == 0 {
            return Err(anyhow!("search.page_size must be greater than 0"));
        }
        if self.search.max_rounds == 0 {
            return Err(anyhow!("search.max_rounds must be greater than 0"));
        }
        if !self.search.index_prefix.is_empty() && !is_index_name_safe(&self.search.index_prefix) {
            return Err(anyhow!(
                "search.index_prefix '{}' cannot be used in an index name",
                self.search.index_prefix
            ));
        }

        let mut seen = HashSet::new();
        for source in &self.sources {
            source.validate()?;
            if !seen.insert(source.entity_type.as_str()) {
                return Err(anyhow!(
                    "Entity type '{}' is configured more than once",
                    source.entity_type
                ));
            }
        }
        Ok(())
    }

    /// Find the source mapping for an entity type
    pub fn source(&self, entity_type: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.entity_type == entity_type)
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        let value = match key {
            "database.path" => match &self.database.path {
                Some(path) => path.display().to_string(),
                None => "(default: <config_dir>/searchgate.db)".to_string(),
            },
            "database.max_connections" => self.database.max_connections.to_string(),

            "queue.batch_size" => self.queue.batch_size.to_string(),
            "queue.max_processed_per_execution" => {
                self.queue.max_processed_per_execution.to_string()
            }
            "queue.interval_secs" => self.queue.interval_secs.to_string(),
            "queue.lease_ttl_secs" => self.queue.lease_ttl_secs.to_string(),
            "queue.claim_ttl_secs" => self.queue.claim_ttl_secs.to_string(),

            "search.backend" => self.search.backend.to_string(),
            "search.url" => self.search.url.clone(),
            "search.username" => self.search.username.clone().unwrap_or_default(),
            "search.password" => match self.search.resolved_password()? {
                Some(_) => "***".to_string(),
                None => format!("(not set - use {} env var)", BACKEND_PASSWORD_ENV),
            },
            "search.index_prefix" => self.search.index_prefix.clone(),
            "search.default_strategy" => self.search.default_strategy.clone(),
            "search.highlight_pre_tag" => self.search.highlight_pre_tag.clone(),
            "search.highlight_post_tag" => self.search.highlight_post_tag.clone(),
            "search.page_size" => self.search.page_size.to_string(),
            "search.max_rounds" => self.search.max_rounds.to_string(),
            "search.request_timeout_secs" => self.search.request_timeout_secs.to_string(),
            "search.retry_max_attempts" => self.search.retry_max_attempts.to_string(),
            "search.retry_backoff_ms" => self.search.retry_backoff_ms.to_string(),

            _ => {
                return Err(anyhow!(
                    "Unknown configuration key: {}. Use `searchgate config list` to see available keys.",
                    key
                ));
            }
        };
        Ok(value)
    }

    /// Set a configuration value by key
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            "database.path" => self.database.path = Some(PathBuf::from(value)),
            "database.max_connections" => {
                self.database.max_connections = parse_positive(key, value)?;
            }

            "queue.batch_size" => self.queue.batch_size = parse_positive(key, value)?,
            "queue.max_processed_per_execution" => {
                self.queue.max_processed_per_execution = parse_positive(key, value)?;
            }
            "queue.interval_secs" => {
                self.queue.interval_secs = value
                    .parse()
                    .with_context(|| format!("Invalid interval_secs value: {}", value))?;
            }
            "queue.lease_ttl_secs" => self.queue.lease_ttl_secs = parse_positive(key, value)?,
            "queue.claim_ttl_secs" => self.queue.claim_ttl_secs = parse_positive(key, value)?,

            "search.backend" => {
                self.search.backend = value.parse().map_err(|e: String| anyhow!(e))?;
            }
            "search.url" => {
                if !(value.starts_with("http://") || value.starts_with("https://")) {
                    return Err(anyhow!("search.url must start with http:// or https://"));
                }
                self.search.url = value.trim_end_matches('/').to_string();
            }
            "search.username" => {
                self.search.username = Some(value.to_string()).filter(|v| !v.is_empty());
            }
            "search.password" => {
                return Err(anyhow!(
                    "Passwords cannot be stored in configuration for security. \
                     Set the {} environment variable instead.",
                    BACKEND_PASSWORD_ENV
                ));
            }
            "search.index_prefix" => self.search.index_prefix = value.to_lowercase(),
            "search.default_strategy" => self.search.default_strategy = value.to_string(),
            "search.highlight_pre_tag" => self.search.highlight_pre_tag = value.to_string(),
            "search.highlight_post_tag" => self.search.highlight_post_tag = value.to_string(),
            "search.page_size" => self.search.page_size = parse_positive(key, value)?,
            "search.max_rounds" => self.search.max_rounds = parse_positive(key, value)?,
            "search.request_timeout_secs" => {
                self.search.request_timeout_secs = parse_positive(key, value)?;
            }
            "search.retry_max_attempts" => {
                self.search.retry_max_attempts = parse_positive(key, value)?;
            }
            "search.retry_backoff_ms" => {
                self.search.retry_backoff_ms = value
                    .parse()
                    .with_context(|| format!("Invalid retry_backoff_ms value: {}", value))?;
            }

            _ => {
                return Err(anyhow!(
                    "Unknown configuration key: {}. Use `searchgate config list` to see available keys.",
                    key
                ));
            }
        }
        Ok(())
    }

    /// List all configuration keys and their values
    pub fn list(&self) -> anyhow::Result<Vec<(String, String)>> {
        KEYS.iter()
            .map(|key| {
                let value = self.get(key)?;
                Ok((key.to_string(), value))
            })
            .collect()
    }

    /// Reset configuration to defaults
    pub fn reset() -> anyhow::Result<()> {
        let path = Self::config_path()?;
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove config file: {}", path.display()))?;
        }
        Ok(())
    }
}

fn parse_positive<T>(key: &str, value: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    let parsed: T = value
        .parse()
        .map_err(|_| anyhow!("Invalid value for {}: {}", key, value))?;
    if parsed <= T::default() {
        return Err(anyhow!("{} must be greater than 0", key));
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();

        assert_eq!(config.queue.batch_size, 100);
        assert_eq!(config.queue.max_processed_per_execution, 1000);
        assert_eq!(config.search.backend, BackendKind::Elasticsearch);
        assert_eq!(config.search.default_strategy, "any_term_any_field");
        assert_eq!(config.search.highlight_pre_tag, "<b>");
        assert!(config.sources.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_with_sources() {
        let config = Config::from_toml(
            r#"
            [queue]
            batch_size = 50
            max_processed_per_execution = 500
            interval_secs = 2
            lease_ttl_secs = 60
            claim_ttl_secs = 120

            [search]
            backend = "opensearch"
            url = "http://search:9200"
            index_prefix = "idx_"
            default_strategy = "phrase"
            highlight_pre_tag = "<em>"
            highlight_post_tag = "</em>"
            page_size = 20
            max_rounds = 5
            request_timeout_secs = 10
            retry_max_attempts = 2
            retry_backoff_ms = 50

            [[sources]]
            entity_type = "sales_Order"
            table = "orders"
            name_column = "number"
            fields = ["number", "customer"]
            row_policy = "region = 'EU'"
            "#,
        )
        .expect("config should parse");

        assert_eq!(config.queue.batch_size, 50);
        assert_eq!(config.search.backend, BackendKind::OpenSearch);
        let source = config.source("sales_Order").expect("source configured");
        assert_eq!(source.id_column, "id");
        assert_eq!(source.fields, vec!["number", "customer"]);
        assert_eq!(source.row_policy.as_deref(), Some("region = 'EU'"));
    }

    #[test]
    fn test_password_in_file_rejected() {
        let result = Config::from_toml(
            r#"
            [search]
            backend = "elasticsearch"
            url = "http://localhost:9200"
            password = "hunter2"
            index_prefix = "search_index_"
            default_strategy = "any_term_any_field"
            highlight_pre_tag = "<b>"
            highlight_post_tag = "</b>"
            page_size = 10
            max_rounds = 10
            request_timeout_secs = 30
            retry_max_attempts = 3
            retry_backoff_ms = 200
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_source_identifier_rejected() {
        let mut config = Config::default();
        config
            .sources
            .push(SourceConfig::new("sales_Order", "orders; DROP TABLE x"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_entity_type_must_form_index_name() {
        let mut config = Config::default();
        config.sources.push(SourceConfig::new("sales/Order", "orders"));
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.search.index_prefix = "idx#".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_source_rejected() {
        let mut config = Config::default();
        config.sources.push(SourceConfig::new("sales_Order", "orders"));
        config.sources.push(SourceConfig::new("sales_Order", "orders_v2"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_set_and_get() {
        let mut config = Config::default();

        config.set("queue.batch_size", "25").unwrap();
        assert_eq!(config.get("queue.batch_size").unwrap(), "25");

        config.set("search.backend", "opensearch").unwrap();
        assert_eq!(config.get("search.backend").unwrap(), "opensearch");

        config.set("search.url", "https://search.local:9200/").unwrap();
        assert_eq!(config.search.url, "https://search.local:9200");

        assert!(config.set("queue.batch_size", "0").is_err());
        assert!(config.set("search.backend", "solr").is_err());
        assert!(config.set("search.url", "search.local").is_err());
        assert!(config.set("search.password", "secret").is_err());
        assert!(config.set("nope", "1").is_err());
    }

    #[test]
    fn test_list_covers_all_keys() {
        let config = Config::default();
        let listed = config.list().unwrap();
        assert_eq!(listed.len(), KEYS.len());
        assert!(listed.iter().any(|(k, _)| k == "search.max_rounds"));
    }

    #[test]
    fn test_serialize_roundtrip() {
        let mut config = Config::default();
        config.sources.push(
            SourceConfig::new("sales_Order", "orders")
                .with_name_column("number")
                .with_fields(&["number"]),
        );

        let text = toml::to_string_pretty(&config).expect("serialize");
        let parsed = Config::from_toml(&text).expect("parse back");
        assert_eq!(parsed.sources, config.sources);
        assert_eq!(parsed.search.url, config.search.url);
    }
}
