//! Consolidated rollback script generation
//!
//! ALTER TABLE auto-commits, so the only way back is a script rebuilt from
//! state captured before the batch ran. The script is a human-reviewable
//! artifact; the engine never executes it.

use indexmap::{IndexMap, IndexSet};
use tracing::debug;

use uplift_core::{Connection, Result};
use uplift_schema::{ColumnInfo, MetadataCache, TableCharset, load_related_foreign_keys};

use crate::options::{FixStrategy, PlannedStep};

const FALLBACK_CHARSET: &str = "utf8mb3";
const FALLBACK_COLLATION: &str = "utf8mb3_general_ci";

/// Pre-change state captured for one location
#[derive(Debug, Clone)]
pub enum PreState {
    Table(TableCharset),
    Column(ColumnInfo),
}

/// Builds the consolidated rollback script for a batch
pub struct RollbackScriptBuilder<'a> {
    conn: &'a dyn Connection,
    metadata: &'a MetadataCache,
    schema: String,
}

impl<'a> RollbackScriptBuilder<'a> {
    pub fn new(conn: &'a dyn Connection, metadata: &'a MetadataCache, schema: &str) -> Self {
        Self {
            conn,
            metadata,
            schema: schema.to_string(),
        }
    }

    /// Capture the state every reversible step is about to change.
    ///
    /// Must run before execution begins; afterwards the catalog already
    /// shows the new state. Cascade strategies capture every related table
    /// as well.
    pub async fn capture_pre_states(
        &self,
        steps: &[PlannedStep],
    ) -> Result<IndexMap<String, PreState>> {
        let mut states = IndexMap::new();

        for step in steps {
            let Some(option) = &step.selected_option else {
                continue;
            };
            if option.strategy.is_skip() || option.strategy.is_manual() {
                continue;
            }
            let Some(table) = step.table_name() else {
                continue;
            };

            if option.strategy.is_charset() {
                if let Some(column) = step.column_name() {
                    if let Some(info) = self.metadata.column_info(self.conn, table, column).await? {
                        states.insert(step.location.clone(), PreState::Column(info));
                    }
                } else {
                    if let Some(charset) = self.metadata.table_charset(self.conn, table).await? {
                        states.insert(step.location.clone(), PreState::Table(charset));
                    }
                    if matches!(
                        option.strategy,
                        FixStrategy::CharsetFkCascade | FixStrategy::CharsetFkSafe
                    ) {
                        for related in &option.related_tables {
                            let location = format!("{}.{related}", self.schema);
                            if states.contains_key(&location) {
                                continue;
                            }
                            if let Some(charset) =
                                self.metadata.table_charset(self.conn, related).await?
                            {
                                states.insert(location, PreState::Table(charset));
                            }
                        }
                    }
                }
            }
        }

        debug!(captured = states.len(), "captured pre-change state");
        Ok(states)
    }

    /// Render the consolidated rollback script for the batch.
    ///
    /// Cascade steps deduplicate by table so overlapping clusters restore
    /// once; column-level steps deduplicate by location so each column of a
    /// table still gets its own restore statement.
    pub async fn build(
        &self,
        steps: &[PlannedStep],
        pre_states: &IndexMap<String, PreState>,
    ) -> Result<String> {
        let mut lines = Vec::new();
        let rule = format!("-- {}", "=".repeat(60));
        lines.push(rule.clone());
        lines.push("-- Migration rollback SQL".to_string());
        lines.push(format!("-- Schema: {}", self.schema));
        lines.push(format!("-- Generated: {}", chrono::Utc::now().to_rfc3339()));
        lines.push(rule);
        lines.push(String::new());
        lines.push("-- Notes:".to_string());
        lines.push("-- 1. This script restores the pre-change state.".to_string());
        lines.push("-- 2. ALTER TABLE auto-commits; run this script manually if needed.".to_string());
        lines.push("-- 3. Date rewrites cannot be rolled back; the original values are gone.".to_string());
        lines.push("-- 4. Review every statement before executing.".to_string());
        lines.push(String::new());

        let mut processed_tables: IndexSet<String> = IndexSet::new();
        let mut processed_locations: IndexSet<String> = IndexSet::new();
        let mut entry_count = 0usize;

        for step in steps {
            let Some(option) = &step.selected_option else {
                continue;
            };
            if option.strategy.is_skip() {
                continue;
            }
            // Folded-in steps are covered by their owning step's entry
            if step.included_by.is_some() {
                continue;
            }

            let Some(table) = step.table_name() else {
                continue;
            };
            let column = step.column_name();

            match option.strategy {
                FixStrategy::CharsetFkCascade | FixStrategy::CharsetFkSafe => {
                    let covered: IndexSet<String> = if option.related_tables.is_empty() {
                        IndexSet::from([table.to_string()])
                    } else {
                        option.related_tables.iter().cloned().collect()
                    };
                    if covered.iter().any(|t| processed_tables.contains(t)) {
                        continue;
                    }
                    processed_tables.extend(covered.iter().cloned());
                }
                FixStrategy::CharsetSingle if column.is_some() => {
                    if !processed_locations.insert(step.location.clone()) {
                        continue;
                    }
                }
                _ => {
                    if !processed_tables.insert(table.to_string()) {
                        continue;
                    }
                }
            }

            let entry = self.rollback_entry(step, pre_states).await?;
            if entry.is_empty() {
                continue;
            }
            entry_count += 1;
            lines.push(format!("-- [{entry_count}] {}", step.location));
            lines.push(format!("-- strategy: {}", option.label));
            lines.push(entry);
            lines.push(String::new());
        }

        if entry_count == 0 {
            lines.push("-- (nothing to roll back)".to_string());
        }

        Ok(lines.join("\n"))
    }

    async fn rollback_entry(
        &self,
        step: &PlannedStep,
        pre_states: &IndexMap<String, PreState>,
    ) -> Result<String> {
        let Some(option) = &step.selected_option else {
            return Ok(String::new());
        };
        let Some(table) = step.table_name() else {
            return Ok(String::new());
        };
        let column = step.column_name();

        let mut lines: Vec<String> = Vec::new();
        match option.strategy {
            FixStrategy::DateToNull | FixStrategy::DateToMin | FixStrategy::DateToCustom => {
                lines.push("-- date values cannot be rolled back".to_string());
                lines.push(
                    "-- the originals were zero dates; restore from a backup if needed".to_string(),
                );
                lines.push(format!(
                    "-- table: {table}, column: {}",
                    column.unwrap_or("?")
                ));
            }

            FixStrategy::CharsetSingle => {
                if let Some(column) = column {
                    let info = match pre_states.get(&step.location) {
                        Some(PreState::Column(info)) => Some(info.clone()),
                        _ => self.metadata.column_info(self.conn, table, column).await?,
                    };
                    if let Some(info) = info {
                        let charset = info.character_set.as_deref().unwrap_or(FALLBACK_CHARSET);
                        let collation = info.collation.as_deref().unwrap_or(FALLBACK_COLLATION);
                        lines.push(format!("-- restore {table}.{column} column charset"));
                        lines.push(format!("-- original: {charset} / {collation}"));
                        lines.push(format!(
                            "ALTER TABLE `{}`.`{table}` MODIFY COLUMN `{column}` {};",
                            self.schema,
                            restore_column_definition(&info, charset, collation)
                        ));
                    }
                } else {
                    let charset = self.table_pre_state(table, &step.location, pre_states).await?;
                    lines.push(format!("-- restore {table} table charset"));
                    lines.push(format!(
                        "-- original: {} / {}",
                        charset.charset, charset.collation
                    ));
                    lines.push(convert_statement(&self.schema, table, &charset));
                }
            }

            FixStrategy::CharsetFkCascade | FixStrategy::CharsetFkSafe => {
                let related: Vec<String> = if option.related_tables.is_empty() {
                    vec![table.to_string()]
                } else {
                    option.related_tables.clone()
                };

                lines.push("-- restore charset across FK-related tables".to_string());
                lines.push(format!("-- tables: {}", related.join(", ")));
                lines.push(String::new());

                let (drop_fks, add_fks) = if option.strategy == FixStrategy::CharsetFkSafe {
                    let fks =
                        load_related_foreign_keys(self.conn, &self.schema, &related).await?;
                    (
                        fks.iter().map(|fk| fk.drop_sql(&self.schema)).collect(),
                        fks.iter().map(|fk| fk.add_sql(&self.schema)).collect(),
                    )
                } else {
                    (Vec::new(), Vec::new())
                };

                if option.strategy == FixStrategy::CharsetFkSafe {
                    lines.push("-- Phase 1: drop foreign keys".to_string());
                    if drop_fks.is_empty() {
                        lines.push("-- (no FK definitions found)".to_string());
                    } else {
                        lines.extend(drop_fks);
                    }
                    lines.push(String::new());
                }

                lines.push("-- Phase 2: restore charset".to_string());
                for related_table in &related {
                    let location = format!("{}.{related_table}", self.schema);
                    let charset = self
                        .table_pre_state(related_table, &location, pre_states)
                        .await?;
                    lines.push(format!(
                        "-- {related_table}: {} / {}",
                        charset.charset, charset.collation
                    ));
                    lines.push(convert_statement(&self.schema, related_table, &charset));
                }

                if option.strategy == FixStrategy::CharsetFkSafe {
                    lines.push(String::new());
                    lines.push("-- Phase 3: recreate foreign keys".to_string());
                    if add_fks.is_empty() {
                        lines.push("-- (no FK definitions found)".to_string());
                    } else {
                        lines.extend(add_fks);
                    }
                }
            }

            FixStrategy::Skip | FixStrategy::Manual => {}
        }

        Ok(lines.join("\n"))
    }

    async fn table_pre_state(
        &self,
        table: &str,
        location: &str,
        pre_states: &IndexMap<String, PreState>,
    ) -> Result<TableCharset> {
        if let Some(PreState::Table(charset)) = pre_states.get(location) {
            return Ok(charset.clone());
        }
        // Column-level captures still identify the table's original charset
        for (key, state) in pre_states {
            if key.starts_with(&format!("{location}.")) {
                if let PreState::Column(info) = state {
                    if let (Some(charset), Some(collation)) =
                        (info.character_set.clone(), info.collation.clone())
                    {
                        return Ok(TableCharset { charset, collation });
                    }
                }
            }
        }
        if let Some(charset) = self.metadata.table_charset(self.conn, table).await? {
            return Ok(charset);
        }
        Ok(TableCharset {
            charset: FALLBACK_CHARSET.to_string(),
            collation: FALLBACK_COLLATION.to_string(),
        })
    }
}

fn convert_statement(schema: &str, table: &str, charset: &TableCharset) -> String {
    format!(
        "ALTER TABLE `{schema}`.`{table}` CONVERT TO CHARACTER SET {} COLLATE {};",
        charset.charset, charset.collation
    )
}

/// Column definition for the restore MODIFY: type, nullability, default,
/// extras, then the original CHARACTER SET / COLLATE pair
fn restore_column_definition(info: &ColumnInfo, charset: &str, collation: &str) -> String {
    let mut parts = vec![info.column_type.clone()];
    parts.push(if info.is_nullable { "NULL" } else { "NOT NULL" }.to_string());

    let default = format_default_clause(info);
    if !default.is_empty() {
        parts.push(default);
    }
    let extra = format_extra_clause(info);
    if !extra.is_empty() {
        parts.push(extra);
    }
    parts.push(format!("CHARACTER SET {charset} COLLATE {collation}"));
    parts.join(" ")
}

/// DEFAULT clause with MySQL quoting rules: functions and numeric types
/// unquoted, string literals quoted with doubled single quotes
fn format_default_clause(info: &ColumnInfo) -> String {
    let Some(default) = &info.default_value else {
        return if info.is_nullable {
            "DEFAULT NULL".to_string()
        } else {
            String::new()
        };
    };

    const UNQUOTED: [&str; 8] = [
        "CURRENT_TIMESTAMP",
        "CURRENT_DATE",
        "CURRENT_TIME",
        "NOW",
        "UUID",
        "LOCALTIME",
        "LOCALTIMESTAMP",
        "CURRENT_USER",
    ];
    let stripped = default.to_uppercase();
    let stripped = stripped.trim_end_matches("()");
    if UNQUOTED.contains(&stripped) {
        return format!("DEFAULT {default}");
    }

    const NUMERIC_PREFIXES: [&str; 12] = [
        "INT", "TINYINT", "SMALLINT", "MEDIUMINT", "BIGINT", "DECIMAL", "FLOAT", "DOUBLE",
        "NUMERIC", "BIT", "YEAR", "BOOL",
    ];
    let column_type = info.column_type.to_uppercase();
    if NUMERIC_PREFIXES.iter().any(|p| column_type.starts_with(p)) {
        return format!("DEFAULT {default}");
    }

    format!("DEFAULT '{}'", default.replace('\'', "''"))
}

/// EXTRA attributes worth restoring; internal markers like
/// DEFAULT_GENERATED are dropped
fn format_extra_clause(info: &ColumnInfo) -> String {
    let extra = info.extra.to_lowercase();
    let mut parts = Vec::new();
    if extra.contains("auto_increment") {
        parts.push("AUTO_INCREMENT");
    }
    if extra.contains("on update current_timestamp") {
        parts.push("ON UPDATE CURRENT_TIMESTAMP");
    }
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use uplift_core::{IssueKind, mock::MockConnection};

    use crate::options::FixOption;

    fn column_info(
        column_type: &str,
        nullable: bool,
        default: Option<&str>,
        extra: &str,
    ) -> ColumnInfo {
        ColumnInfo {
            column_type: column_type.to_string(),
            is_nullable: nullable,
            default_value: default.map(String::from),
            extra: extra.to_string(),
            character_set: Some("utf8mb3".to_string()),
            collation: Some("utf8mb3_general_ci".to_string()),
        }
    }

    fn option(strategy: FixStrategy, related: &[&str]) -> FixOption {
        FixOption {
            strategy,
            label: format!("{strategy:?}"),
            description: String::new(),
            sql_template: None,
            requires_input: false,
            input_label: None,
            input_default: None,
            is_recommended: false,
            related_tables: related.iter().map(|t| t.to_string()).collect(),
            modify_clause: None,
        }
    }

    fn step(location: &str, strategy: FixStrategy, related: &[&str]) -> PlannedStep {
        PlannedStep {
            issue_index: 0,
            kind: IssueKind::Charset,
            location: location.to_string(),
            description: String::new(),
            options: Vec::new(),
            selected_option: Some(option(strategy, related)),
            user_input: None,
            included_by: None,
            included_reason: String::new(),
        }
    }

    fn table_state(charset: &str, collation: &str) -> PreState {
        PreState::Table(TableCharset {
            charset: charset.to_string(),
            collation: collation.to_string(),
        })
    }

    #[test]
    fn default_clause_quoting_rules() {
        let literal = column_info("varchar(10)", false, Some("pend'ing"), "");
        assert_eq!(format_default_clause(&literal), "DEFAULT 'pend''ing'");

        let function = column_info("timestamp", true, Some("CURRENT_TIMESTAMP"), "");
        assert_eq!(format_default_clause(&function), "DEFAULT CURRENT_TIMESTAMP");

        let numeric = column_info("int(11)", false, Some("0"), "");
        assert_eq!(format_default_clause(&numeric), "DEFAULT 0");

        let nullable_no_default = column_info("varchar(10)", true, None, "");
        assert_eq!(format_default_clause(&nullable_no_default), "DEFAULT NULL");
    }

    #[test]
    fn extra_clause_keeps_only_meaningful_attributes() {
        let auto = column_info("int(11)", false, None, "auto_increment");
        assert_eq!(format_extra_clause(&auto), "AUTO_INCREMENT");

        let generated = column_info("timestamp", true, None, "DEFAULT_GENERATED");
        assert_eq!(format_extra_clause(&generated), "");

        let on_update = column_info(
            "timestamp",
            true,
            None,
            "DEFAULT_GENERATED on update CURRENT_TIMESTAMP",
        );
        assert_eq!(format_extra_clause(&on_update), "ON UPDATE CURRENT_TIMESTAMP");
    }

    #[tokio::test]
    async fn table_rollback_uses_captured_state() {
        let conn = MockConnection::new();
        let metadata = MetadataCache::new("shop");
        let builder = RollbackScriptBuilder::new(&conn, &metadata, "shop");

        let steps = vec![step("shop.orders", FixStrategy::CharsetSingle, &[])];
        let mut pre_states = IndexMap::new();
        pre_states.insert(
            "shop.orders".to_string(),
            table_state("latin1", "latin1_swedish_ci"),
        );

        let script = builder.build(&steps, &pre_states).await.unwrap();
        assert!(script.contains(
            "ALTER TABLE `shop`.`orders` CONVERT TO CHARACTER SET latin1 COLLATE latin1_swedish_ci;"
        ));
    }

    #[tokio::test]
    async fn cascade_steps_deduplicate_by_table_cluster() {
        let conn = MockConnection::new();
        let metadata = MetadataCache::new("shop");
        let builder = RollbackScriptBuilder::new(&conn, &metadata, "shop");

        let cluster = ["regions", "customers", "orders"];
        let steps = vec![
            step("shop.orders", FixStrategy::CharsetFkCascade, &cluster),
            step("shop.customers", FixStrategy::CharsetFkCascade, &cluster),
        ];
        let mut pre_states = IndexMap::new();
        for table in cluster {
            pre_states.insert(
                format!("shop.{table}"),
                table_state("utf8mb3", "utf8mb3_general_ci"),
            );
        }

        let script = builder.build(&steps, &pre_states).await.unwrap();
        let restores = script
            .matches("CONVERT TO CHARACTER SET utf8mb3")
            .count();
        assert_eq!(restores, 3);
        assert!(script.contains("-- [1] shop.orders"));
        assert!(!script.contains("-- [2]"));
    }

    #[tokio::test]
    async fn date_fixes_are_marked_irreversible() {
        let conn = MockConnection::new();
        let metadata = MetadataCache::new("shop");
        let builder = RollbackScriptBuilder::new(&conn, &metadata, "shop");

        let steps = vec![step(
            "shop.orders.created_at",
            FixStrategy::DateToNull,
            &[],
        )];
        let script = builder.build(&steps, &IndexMap::new()).await.unwrap();
        assert!(script.contains("date values cannot be rolled back"));
        assert!(!script.contains("UPDATE"));
    }

    #[tokio::test]
    async fn included_steps_are_not_rolled_back_twice() {
        let conn = MockConnection::new();
        let metadata = MetadataCache::new("shop");
        let builder = RollbackScriptBuilder::new(&conn, &metadata, "shop");

        let mut folded = step("shop.customers", FixStrategy::CharsetSingle, &[]);
        folded.included_by = Some("orders".to_string());
        let steps = vec![folded];

        let script = builder.build(&steps, &IndexMap::new()).await.unwrap();
        assert!(script.contains("(nothing to roll back)"));
    }

    #[tokio::test]
    async fn column_rollback_restores_full_definition() {
        let conn = MockConnection::new();
        let metadata = MetadataCache::new("shop");
        let builder = RollbackScriptBuilder::new(&conn, &metadata, "shop");

        let steps = vec![step(
            "shop.customers.name",
            FixStrategy::CharsetSingle,
            &[],
        )];
        let mut pre_states = IndexMap::new();
        pre_states.insert(
            "shop.customers.name".to_string(),
            PreState::Column(column_info("varchar(64)", false, Some("unknown"), "")),
        );

        let script = builder.build(&steps, &pre_states).await.unwrap();
        assert!(script.contains(
            "MODIFY COLUMN `name` varchar(64) NOT NULL DEFAULT 'unknown' \
             CHARACTER SET utf8mb3 COLLATE utf8mb3_general_ci;"
        ));
    }
}
