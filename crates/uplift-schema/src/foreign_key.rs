//! Foreign key definitions and catalog loading

use indexmap::IndexMap;
use itertools::Itertools;
use serde::Serialize;
use tracing::debug;

use uplift_core::{Connection, Result};

/// One foreign key constraint, as read from the FK catalog.
///
/// Composite keys carry multiple columns, ordered by ordinal position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForeignKeyDefinition {
    pub constraint_name: String,
    pub table_name: String,
    pub columns: Vec<String>,
    pub referenced_table: String,
    pub referenced_columns: Vec<String>,
    pub on_delete: String,
    pub on_update: String,
}

impl ForeignKeyDefinition {
    /// DDL that drops this constraint
    pub fn drop_sql(&self, schema: &str) -> String {
        format!(
            "ALTER TABLE `{}`.`{}` DROP FOREIGN KEY `{}`;",
            schema, self.table_name, self.constraint_name
        )
    }

    /// DDL that recreates this constraint exactly as captured, including its
    /// referential action rules
    pub fn add_sql(&self, schema: &str) -> String {
        let cols = self.columns.iter().map(|c| format!("`{c}`")).join(", ");
        let ref_cols = self
            .referenced_columns
            .iter()
            .map(|c| format!("`{c}`"))
            .join(", ");
        format!(
            "ALTER TABLE `{}`.`{}` ADD CONSTRAINT `{}` \
             FOREIGN KEY ({}) REFERENCES `{}` ({}) \
             ON DELETE {} ON UPDATE {};",
            schema,
            self.table_name,
            self.constraint_name,
            cols,
            self.referenced_table,
            ref_cols,
            self.on_delete,
            self.on_update
        )
    }
}

fn quoted_list(tables: &[String]) -> String {
    tables.iter().map(|t| format!("'{t}'")).join(", ")
}

/// Load every FK constraint touching any table in `tables`, as either the
/// child or the referenced side. Views are excluded on both sides; only
/// BASE TABLE relationships matter for DDL ordering.
///
/// Composite FKs come back as one definition with columns grouped by
/// ordinal position.
pub async fn load_related_foreign_keys(
    conn: &dyn Connection,
    schema: &str,
    tables: &[String],
) -> Result<Vec<ForeignKeyDefinition>> {
    if tables.is_empty() {
        return Ok(Vec::new());
    }

    let list = quoted_list(tables);
    let sql = format!(
        "SELECT \
            kcu.CONSTRAINT_NAME, \
            kcu.TABLE_NAME, \
            kcu.COLUMN_NAME, \
            kcu.REFERENCED_TABLE_NAME, \
            kcu.REFERENCED_COLUMN_NAME, \
            rc.DELETE_RULE, \
            rc.UPDATE_RULE \
        FROM INFORMATION_SCHEMA.KEY_COLUMN_USAGE kcu \
        JOIN INFORMATION_SCHEMA.REFERENTIAL_CONSTRAINTS rc \
            ON kcu.CONSTRAINT_NAME = rc.CONSTRAINT_NAME \
            AND kcu.TABLE_SCHEMA = rc.CONSTRAINT_SCHEMA \
        JOIN INFORMATION_SCHEMA.TABLES t_child \
            ON kcu.TABLE_NAME = t_child.TABLE_NAME \
            AND kcu.TABLE_SCHEMA = t_child.TABLE_SCHEMA \
        JOIN INFORMATION_SCHEMA.TABLES t_parent \
            ON kcu.REFERENCED_TABLE_NAME = t_parent.TABLE_NAME \
            AND kcu.TABLE_SCHEMA = t_parent.TABLE_SCHEMA \
        WHERE kcu.TABLE_SCHEMA = '{schema}' \
            AND kcu.REFERENCED_TABLE_NAME IS NOT NULL \
            AND t_child.TABLE_TYPE = 'BASE TABLE' \
            AND t_parent.TABLE_TYPE = 'BASE TABLE' \
            AND (kcu.TABLE_NAME IN ({list}) OR kcu.REFERENCED_TABLE_NAME IN ({list})) \
        ORDER BY kcu.TABLE_NAME, kcu.CONSTRAINT_NAME, kcu.ORDINAL_POSITION"
    );

    let result = conn.query(&sql).await?;

    // Group composite FK rows by (table, constraint); ORDER BY keeps the
    // column lists in ordinal order.
    let mut fk_map: IndexMap<String, ForeignKeyDefinition> = IndexMap::new();
    for row in &result.rows {
        let (Some(constraint), Some(table), Some(column), Some(ref_table), Some(ref_column)) = (
            row.get_str("CONSTRAINT_NAME"),
            row.get_str("TABLE_NAME"),
            row.get_str("COLUMN_NAME"),
            row.get_str("REFERENCED_TABLE_NAME"),
            row.get_str("REFERENCED_COLUMN_NAME"),
        ) else {
            continue;
        };

        let key = format!("{table}.{constraint}");
        let entry = fk_map
            .entry(key)
            .or_insert_with(|| ForeignKeyDefinition {
                constraint_name: constraint.to_string(),
                table_name: table.to_string(),
                columns: Vec::new(),
                referenced_table: ref_table.to_string(),
                referenced_columns: Vec::new(),
                on_delete: row.get_str("DELETE_RULE").unwrap_or("RESTRICT").to_string(),
                on_update: row.get_str("UPDATE_RULE").unwrap_or("RESTRICT").to_string(),
            });
        entry.columns.push(column.to_string());
        entry.referenced_columns.push(ref_column.to_string());
    }

    debug!(
        schema,
        tables = tables.len(),
        foreign_keys = fk_map.len(),
        "loaded related foreign keys"
    );
    Ok(fk_map.into_values().collect())
}
