//! Entity enumeration and document loading from SQL tables

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;

use super::{MAX_IDS_PER_QUERY, SourceTables, policy_clause, quote};
use crate::config::SourceConfig;
use crate::domain::queue::{DocumentLoader, EntityRef, EntitySource};
use crate::domain::search::{ENTITY_TYPE_FIELD, INSTANCE_NAME_FIELD};
use crate::domain::security::Principal;
use crate::error::{Error, Result};
use crate::storage::placeholders;

/// Reads indexed entities straight from their tables
#[derive(Debug, Clone)]
pub struct SqlTableSource {
    pool: SqlitePool,
    tables: SourceTables,
}

impl SqlTableSource {
    pub fn new(pool: SqlitePool, sources: &[SourceConfig]) -> Result<Self> {
        Ok(Self {
            pool,
            tables: SourceTables::new(sources)?,
        })
    }

    /// `CAST(col AS TEXT)` for id, name and every field, in that order
    fn select_list(source: &SourceConfig) -> String {
        let mut columns = vec![&source.id_column];
        columns.extend(source.name_column.iter());
        columns.extend(source.fields.iter());
        columns
            .into_iter()
            .map(|c| format!("CAST({} AS TEXT)", quote(c)))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[async_trait]
impl EntitySource for SqlTableSource {
    async fn load_refs(
        &self,
        principal: &Principal,
        entity_type: &str,
        after_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<EntityRef>> {
        let source = self.tables.get(entity_type)?;
        let id = quote(&source.id_column);

        let mut conditions = Vec::new();
        if after_id.is_some() {
            conditions.push(format!("{} > ?", id));
        }
        let policy = policy_clause(source, principal);
        if let Some((clause, _)) = &policy {
            conditions.push(clause.clone());
        }
        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        };

        let name = source
            .name_column
            .as_deref()
            .map(|c| format!("CAST({} AS TEXT)", quote(c)))
            .unwrap_or_else(|| "NULL".to_string());
        let sql = format!(
            "SELECT CAST({id} AS TEXT), {name} FROM {table}{where_clause} ORDER BY {id} LIMIT ?",
            table = quote(&source.table),
        );

        let mut query = sqlx::query(&sql);
        if let Some(after_id) = after_id {
            query = query.bind(after_id);
        }
        if let Some((_, binds)) = &policy {
            for _ in 0..*binds {
                query = query.bind(principal.name());
            }
        }
        let rows = query
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;

        rows.iter()
            .map(|row| {
                let id: String = row.try_get(0)?;
                let name: Option<String> = row.try_get(1)?;
                let entity = EntityRef::new(entity_type, id);
                Ok(match name {
                    Some(name) => entity.with_name(name),
                    None => entity,
                })
            })
            .collect::<std::result::Result<Vec<_>, sqlx::Error>>()
            .map_err(Error::DatabaseError)
    }
}

#[async_trait]
impl DocumentLoader for SqlTableSource {
    async fn load_documents(
        &self,
        principal: &Principal,
        entity_type: &str,
        ids: &[String],
    ) -> Result<HashMap<String, Value>> {
        let source = self.tables.get(entity_type)?;
        let policy = policy_clause(source, principal);
        let mut documents = HashMap::with_capacity(ids.len());

        for chunk in ids.chunks(MAX_IDS_PER_QUERY) {
            let mut sql = format!(
                "SELECT {} FROM {} WHERE {} IN ({})",
                Self::select_list(source),
                quote(&source.table),
                quote(&source.id_column),
                placeholders(chunk.len())
            );
            if let Some((clause, _)) = &policy {
                sql.push_str(" AND ");
                sql.push_str(clause);
            }

            let mut query = sqlx::query(&sql);
            for id in chunk {
                query = query.bind(id.as_str());
            }
            if let Some((_, binds)) = &policy {
                for _ in 0..*binds {
                    query = query.bind(principal.name());
                }
            }
            let rows = query
                .fetch_all(&self.pool)
                .await
                .map_err(Error::DatabaseError)?;

            for row in rows {
                let id: String = row.try_get(0).map_err(Error::DatabaseError)?;
                let mut column = 1;
                let mut document = Map::new();
                document.insert(ENTITY_TYPE_FIELD.to_string(), json!(entity_type));
                if source.name_column.is_some() {
                    let name: Option<String> =
                        row.try_get(column).map_err(Error::DatabaseError)?;
                    document.insert(INSTANCE_NAME_FIELD.to_string(), json!(name));
                    column += 1;
                }
                for field in &source.fields {
                    let value: Option<String> =
                        row.try_get(column).map_err(Error::DatabaseError)?;
                    if let Some(value) = value {
                        document.insert(field.clone(), Value::String(value));
                    }
                    column += 1;
                }
                documents.insert(id, Value::Object(document));
            }
        }

        Ok(documents)
    }
}
