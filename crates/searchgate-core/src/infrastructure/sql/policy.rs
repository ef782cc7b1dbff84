//! Row-level policies evaluated by the database

use async_trait::async_trait;
use sqlx::SqlitePool;
use std::collections::HashSet;

use super::{MAX_IDS_PER_QUERY, SourceTables, policy_clause, quote};
use crate::config::SourceConfig;
use crate::domain::security::{Principal, SecurityPolicyStore};
use crate::error::{Error, Result};
use crate::storage::placeholders;

/// Applies each source's `row_policy` predicate when reloading hits
///
/// Types without a configured source are rejected rather than treated as
/// unrestricted.
#[derive(Debug, Clone)]
pub struct SqlPolicyStore {
    pool: SqlitePool,
    tables: SourceTables,
}

impl SqlPolicyStore {
    pub fn new(pool: SqlitePool, sources: &[SourceConfig]) -> Result<Self> {
        Ok(Self {
            pool,
            tables: SourceTables::new(sources)?,
        })
    }
}

#[async_trait]
impl SecurityPolicyStore for SqlPolicyStore {
    async fn has_row_level_policies(
        &self,
        principal: &Principal,
        entity_type: &str,
    ) -> Result<bool> {
        let source = self.tables.get(entity_type)?;
        Ok(policy_clause(source, principal).is_some())
    }

    async fn reload_permitted(
        &self,
        principal: &Principal,
        entity_type: &str,
        ids: &[String],
    ) -> Result<HashSet<String>> {
        let source = self.tables.get(entity_type)?;
        let policy = policy_clause(source, principal);
        let id = quote(&source.id_column);
        let mut permitted = HashSet::with_capacity(ids.len());

        for chunk in ids.chunks(MAX_IDS_PER_QUERY) {
            let mut sql = format!(
                "SELECT CAST({id} AS TEXT) FROM {} WHERE {id} IN ({})",
                quote(&source.table),
                placeholders(chunk.len())
            );
            if let Some((clause, _)) = &policy {
                sql.push_str(" AND ");
                sql.push_str(clause);
            }

            let mut query = sqlx::query_scalar::<_, String>(&sql);
            for id in chunk {
                query = query.bind(id.as_str());
            }
            if let Some((_, binds)) = &policy {
                for _ in 0..*binds {
                    query = query.bind(principal.name());
                }
            }
            permitted.extend(
                query
                    .fetch_all(&self.pool)
                    .await
                    .map_err(Error::DatabaseError)?,
            );
        }

        Ok(permitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;

    async fn sample_db() -> Database {
        let db = Database::in_memory().await.unwrap();
        sqlx::query("CREATE TABLE customers (code TEXT PRIMARY KEY, region TEXT, manager TEXT)")
            .execute(db.pool())
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO customers (code, region, manager) VALUES
                ('c1', 'EU', 'alice'), ('c2', 'US', 'bob'), ('c3', 'EU', 'bob')",
        )
        .execute(db.pool())
        .await
        .unwrap();
        db
    }

    fn sources() -> Vec<SourceConfig> {
        let mut restricted = SourceConfig::new("sales_Customer", "customers")
            .with_row_policy("region = 'EU' OR manager = :principal");
        restricted.id_column = "code".to_string();
        let mut open = SourceConfig::new("sales_Lead", "customers");
        open.id_column = "code".to_string();
        vec![restricted, open]
    }

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[tokio::test]
    async fn test_policy_flags() {
        let db = sample_db().await;
        let store = SqlPolicyStore::new(db.pool().clone(), &sources()).unwrap();
        let alice = Principal::user("alice");

        assert!(store.has_row_level_policies(&alice, "sales_Customer").await.unwrap());
        assert!(!store.has_row_level_policies(&alice, "sales_Lead").await.unwrap());
        assert!(
            !store
                .has_row_level_policies(&Principal::system(), "sales_Customer")
                .await
                .unwrap()
        );
        assert!(matches!(
            store.has_row_level_policies(&alice, "hr_Employee").await,
            Err(Error::UnknownEntityType(_))
        ));
    }

    #[tokio::test]
    async fn test_reload_filters_by_predicate() {
        let db = sample_db().await;
        let store = SqlPolicyStore::new(db.pool().clone(), &sources()).unwrap();
        let all = ids(&["c1", "c2", "c3", "gone"]);

        let alice = store
            .reload_permitted(&Principal::user("alice"), "sales_Customer", &all)
            .await
            .unwrap();
        assert_eq!(alice, HashSet::from(["c1".to_string(), "c3".to_string()]));

        let bob = store
            .reload_permitted(&Principal::user("bob"), "sales_Customer", &all)
            .await
            .unwrap();
        assert_eq!(bob.len(), 3);

        let system = store
            .reload_permitted(&Principal::system(), "sales_Customer", &all)
            .await
            .unwrap();
        assert_eq!(system.len(), 3);
        assert!(!system.contains("gone"));
    }
}
