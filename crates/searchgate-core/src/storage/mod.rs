//! Storage layer - SQLite
//!
//! Provides database management and migrations for searchgate.
//!
//! # Architecture
//!
//! - `database`: Connection pool management and initialization
//! - `migrations`: Schema versioning and automatic migration
//!
//! # Usage
//!
//! ```ignore
//! use searchgate_core::storage::Database;
//!
//! // Create an in-memory database for testing
//! let db = Database::in_memory().await?;
//!
//! // Or open the configured queue database
//! let db = Database::open(config.database_path()?).await?;
//! ```

pub mod database;
pub mod migrations;

pub use database::{Database, DatabaseConfig};
pub use migrations::{CURRENT_VERSION, MigrationStatus, migration_status, run_migrations};

/// Check that a configured table or column name is a plain SQL identifier
///
/// Identifiers are spliced into dynamic SQL, so only `[A-Za-z_][A-Za-z0-9_]*`
/// is accepted.
pub fn is_sql_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Build `?, ?, ?` for an `IN (...)` clause
pub(crate) fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}
