//! Session-scoped metadata cache
//!
//! Column and charset metadata is read repeatedly while building fix options
//! and rollback SQL. The cache is owned by the planning session that created
//! it and dies with it; it is never shared across sessions, so a concurrent
//! schema change elsewhere only requires `invalidate` on this one object.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use tracing::debug;

use uplift_core::{Connection, Result};

/// Charset and collation of one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableCharset {
    pub charset: String,
    pub collation: String,
}

/// Raw column attributes from `INFORMATION_SCHEMA.COLUMNS`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnInfo {
    pub column_type: String,
    pub is_nullable: bool,
    pub default_value: Option<String>,
    pub extra: String,
    pub character_set: Option<String>,
    pub collation: Option<String>,
}

#[derive(Default)]
struct CacheState {
    nullability: HashMap<String, bool>,
    columns: HashMap<String, Option<ColumnInfo>>,
    table_charsets: HashMap<String, Option<TableCharset>>,
}

/// Cache over `INFORMATION_SCHEMA` reads for one schema
pub struct MetadataCache {
    schema: String,
    state: RwLock<CacheState>,
}

impl std::fmt::Debug for MetadataCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataCache")
            .field("schema", &self.schema)
            .finish()
    }
}

impl MetadataCache {
    pub fn new(schema: &str) -> Self {
        Self {
            schema: schema.to_string(),
            state: RwLock::new(CacheState::default()),
        }
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Drop everything cached. Call after executing DDL through the same
    /// session, or when an external change is suspected.
    pub fn invalidate(&self) {
        let mut state = self.state.write();
        state.nullability.clear();
        state.columns.clear();
        state.table_charsets.clear();
        debug!(schema = %self.schema, "metadata cache invalidated");
    }

    /// Whether `table.column` accepts NULL. Unknown columns report `false`.
    pub async fn is_nullable(
        &self,
        conn: &dyn Connection,
        table: &str,
        column: &str,
    ) -> Result<bool> {
        let key = format!("{table}.{column}");
        if let Some(cached) = self.state.read().nullability.get(&key) {
            return Ok(*cached);
        }

        let sql = format!(
            "SELECT IS_NULLABLE FROM INFORMATION_SCHEMA.COLUMNS \
             WHERE TABLE_SCHEMA = '{}' AND TABLE_NAME = '{table}' AND COLUMN_NAME = '{column}'",
            self.schema
        );
        let result = conn.query(&sql).await?;
        let nullable = result
            .first()
            .and_then(|row| row.get_str("IS_NULLABLE"))
            .is_some_and(|v| v == "YES");

        self.state.write().nullability.insert(key, nullable);
        Ok(nullable)
    }

    /// Raw column attributes, or `None` when the column does not exist
    pub async fn column_info(
        &self,
        conn: &dyn Connection,
        table: &str,
        column: &str,
    ) -> Result<Option<ColumnInfo>> {
        let key = format!("{table}.{column}");
        if let Some(cached) = self.state.read().columns.get(&key) {
            return Ok(cached.clone());
        }

        let sql = format!(
            "SELECT COLUMN_TYPE, IS_NULLABLE, COLUMN_DEFAULT, EXTRA, \
                    CHARACTER_SET_NAME, COLLATION_NAME \
             FROM INFORMATION_SCHEMA.COLUMNS \
             WHERE TABLE_SCHEMA = '{}' AND TABLE_NAME = '{table}' AND COLUMN_NAME = '{column}'",
            self.schema
        );
        let result = conn.query(&sql).await?;
        let info = result.first().map(|row| ColumnInfo {
            column_type: row.get_str("COLUMN_TYPE").unwrap_or_default().to_string(),
            is_nullable: row.get_str("IS_NULLABLE") == Some("YES"),
            default_value: row.get_str("COLUMN_DEFAULT").map(String::from),
            extra: row.get_str("EXTRA").unwrap_or_default().to_string(),
            character_set: row.get_str("CHARACTER_SET_NAME").map(String::from),
            collation: row.get_str("COLLATION_NAME").map(String::from),
        });

        self.state.write().columns.insert(key, info.clone());
        Ok(info)
    }

    /// Full column definition for a `MODIFY COLUMN` clause.
    ///
    /// CHARACTER SET / COLLATE are part of the data type in MySQL grammar
    /// and must come before NOT NULL / DEFAULT; placing them after is a 1064
    /// syntax error. Pass `charset`/`collation` to override what the column
    /// currently has.
    pub async fn column_definition(
        &self,
        conn: &dyn Connection,
        table: &str,
        column: &str,
        charset: Option<&str>,
        collation: Option<&str>,
    ) -> Result<Option<String>> {
        let Some(info) = self.column_info(conn, table, column).await? else {
            return Ok(None);
        };

        let mut parts = vec![info.column_type.clone()];
        if let Some(charset) = charset {
            parts.push(format!("CHARACTER SET {charset}"));
        }
        if let Some(collation) = collation {
            parts.push(format!("COLLATE {collation}"));
        }
        if !info.is_nullable {
            parts.push("NOT NULL".to_string());
        }
        if let Some(default) = &info.default_value {
            if default.starts_with("CURRENT_") {
                parts.push(format!("DEFAULT {default}"));
            } else {
                parts.push(format!("DEFAULT '{default}'"));
            }
        }
        if !info.extra.is_empty() {
            parts.push(info.extra.to_uppercase());
        }

        Ok(Some(parts.join(" ")))
    }

    /// Current charset and collation of `table`, or `None` for views and
    /// unknown tables
    pub async fn table_charset(
        &self,
        conn: &dyn Connection,
        table: &str,
    ) -> Result<Option<TableCharset>> {
        if let Some(cached) = self.state.read().table_charsets.get(table) {
            return Ok(cached.clone());
        }

        let sql = format!(
            "SELECT ccsa.CHARACTER_SET_NAME, t.TABLE_COLLATION \
             FROM INFORMATION_SCHEMA.TABLES t \
             JOIN INFORMATION_SCHEMA.COLLATION_CHARACTER_SET_APPLICABILITY ccsa \
                 ON t.TABLE_COLLATION = ccsa.COLLATION_NAME \
             WHERE t.TABLE_SCHEMA = '{}' AND t.TABLE_NAME = '{table}'",
            self.schema
        );
        let result = conn.query(&sql).await?;
        let charset = result.first().and_then(|row| {
            Some(TableCharset {
                charset: row.get_str("CHARACTER_SET_NAME")?.to_string(),
                collation: row.get_str("TABLE_COLLATION")?.to_string(),
            })
        });

        self.state
            .write()
            .table_charsets
            .insert(table.to_string(), charset.clone());
        Ok(charset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use uplift_core::{QueryResult, Value, mock::MockConnection};

    fn columns_result(
        column_type: &str,
        nullable: &str,
        default: Option<&str>,
        extra: &str,
    ) -> QueryResult {
        QueryResult::new(
            vec![
                "COLUMN_TYPE",
                "IS_NULLABLE",
                "COLUMN_DEFAULT",
                "EXTRA",
                "CHARACTER_SET_NAME",
                "COLLATION_NAME",
            ],
            vec![vec![
                Value::from(column_type),
                Value::from(nullable),
                Value::from(default),
                Value::from(extra),
                Value::Null,
                Value::Null,
            ]],
        )
    }

    #[tokio::test]
    async fn nullability_is_cached_per_column() {
        let conn = MockConnection::new();
        conn.script_query(
            "IS_NULLABLE",
            QueryResult::new(vec!["IS_NULLABLE"], vec![vec![Value::from("YES")]]),
        );

        let cache = MetadataCache::new("shop");
        assert!(cache.is_nullable(&conn, "orders", "created_at").await.unwrap());
        assert!(cache.is_nullable(&conn, "orders", "created_at").await.unwrap());
        assert_eq!(conn.queried_sql().len(), 1);
    }

    #[tokio::test]
    async fn unknown_column_reports_not_nullable() {
        let conn = MockConnection::new();
        let cache = MetadataCache::new("shop");
        assert!(!cache.is_nullable(&conn, "orders", "ghost").await.unwrap());
    }

    #[tokio::test]
    async fn definition_places_charset_before_not_null() {
        let conn = MockConnection::new();
        conn.script_query(
            "COLUMN_TYPE",
            columns_result("varchar(255)", "NO", None, ""),
        );

        let cache = MetadataCache::new("shop");
        let def = cache
            .column_definition(
                &conn,
                "customers",
                "name",
                Some("utf8mb4"),
                Some("utf8mb4_unicode_ci"),
            )
            .await
            .unwrap();
        assert_eq!(
            def.as_deref(),
            Some("varchar(255) CHARACTER SET utf8mb4 COLLATE utf8mb4_unicode_ci NOT NULL")
        );
    }

    #[tokio::test]
    async fn definition_quotes_literal_defaults_but_not_functions() {
        let conn = MockConnection::new();
        conn.script_query(
            "COLUMN_TYPE",
            columns_result("timestamp", "YES", Some("CURRENT_TIMESTAMP"), ""),
        );

        let cache = MetadataCache::new("shop");
        let def = cache
            .column_definition(&conn, "orders", "updated_at", None, None)
            .await
            .unwrap();
        assert_eq!(def.as_deref(), Some("timestamp DEFAULT CURRENT_TIMESTAMP"));

        let conn = MockConnection::new();
        conn.script_query(
            "COLUMN_TYPE",
            columns_result("varchar(10)", "NO", Some("none"), ""),
        );
        let cache = MetadataCache::new("shop");
        let def = cache
            .column_definition(&conn, "orders", "status", None, None)
            .await
            .unwrap();
        assert_eq!(def.as_deref(), Some("varchar(10) NOT NULL DEFAULT 'none'"));
    }

    #[tokio::test]
    async fn table_charset_reads_applicability_join() {
        let conn = MockConnection::new();
        conn.script_query(
            "COLLATION_CHARACTER_SET_APPLICABILITY",
            QueryResult::new(
                vec!["CHARACTER_SET_NAME", "TABLE_COLLATION"],
                vec![vec![
                    Value::from("utf8mb3"),
                    Value::from("utf8mb3_general_ci"),
                ]],
            ),
        );

        let cache = MetadataCache::new("shop");
        let charset = cache.table_charset(&conn, "orders").await.unwrap().unwrap();
        assert_eq!(charset.charset, "utf8mb3");
        assert_eq!(charset.collation, "utf8mb3_general_ci");
    }

    #[tokio::test]
    async fn invalidate_forces_reload() {
        let conn = MockConnection::new();
        conn.script_query(
            "IS_NULLABLE",
            QueryResult::new(vec!["IS_NULLABLE"], vec![vec![Value::from("YES")]]),
        );

        let cache = MetadataCache::new("shop");
        cache.is_nullable(&conn, "orders", "created_at").await.unwrap();
        cache.invalidate();
        cache.is_nullable(&conn, "orders", "created_at").await.unwrap();
        assert_eq!(conn.queried_sql().len(), 2);
    }
}
