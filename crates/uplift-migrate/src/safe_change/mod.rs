//! FK-safe charset conversion
//!
//! Converting a table's charset while foreign keys still reference it fails
//! with Error 3780: the server validates column-type compatibility across the
//! constraint even with FOREIGN_KEY_CHECKS off. The safe sequence drops every
//! FK touching the target set, converts in parent-first order, then recreates
//! the FKs from their captured definitions.
//!
//! Each phase commits independently. ALTER statements auto-commit on the
//! server, so a failure mid-run cannot be undone transactionally; the
//! recovery document synthesized from the remaining rollback stack is the
//! only safety net.

use indexmap::IndexSet;
use itertools::Itertools;
use tracing::{debug, warn};

use uplift_core::{CancelFlag, Connection, ProgressSink, Result, UpliftError};
use uplift_schema::{ForeignKeyDefinition, RelationshipGraph, load_related_foreign_keys};

#[cfg(test)]
mod tests;

/// The generated three-phase SQL, kept in sections so callers can preview
/// or execute them separately
#[derive(Debug, Clone, Default)]
pub struct SafeChangeScript {
    pub drop_fks: Vec<String>,
    pub alter_tables: Vec<String>,
    pub add_fks: Vec<String>,
}

impl SafeChangeScript {
    pub fn fk_count(&self) -> usize {
        self.drop_fks.len()
    }

    pub fn table_count(&self) -> usize {
        self.alter_tables.len()
    }

    /// Render the whole script with phase markers, for previews and the
    /// cascade fix option's SQL template
    pub fn full_sql(&self) -> String {
        let mut lines = Vec::new();
        lines.push("-- ===== Phase 1: drop foreign keys =====".to_string());
        if self.drop_fks.is_empty() {
            lines.push("-- (no related foreign keys)".to_string());
        } else {
            lines.extend(self.drop_fks.iter().cloned());
        }
        lines.push(String::new());
        lines.push("-- ===== Phase 2: convert charset (parents first) =====".to_string());
        lines.extend(self.alter_tables.iter().cloned());
        lines.push(String::new());
        lines.push("-- ===== Phase 3: recreate foreign keys =====".to_string());
        if self.add_fks.is_empty() {
            lines.push("-- (no foreign keys to recreate)".to_string());
        } else {
            lines.extend(self.add_fks.iter().cloned());
        }
        lines.join("\n")
    }
}

/// Outcome of an executed safe change.
///
/// A failed run is still an `Ok` value: the error is folded into `message`
/// and `recovery_sql` so the caller always receives the artifact.
#[derive(Debug, Clone)]
pub struct SafeChangeOutcome {
    pub success: bool,
    pub message: String,
    pub executed_drop: Vec<String>,
    pub executed_alter: Vec<String>,
    pub executed_add: Vec<String>,
    /// ALTER statements skipped because the target turned out to be a view
    pub skipped_views: Vec<String>,
    /// Whether the dropped FKs were automatically recreated after a failure
    pub auto_recovered: bool,
    /// Manual recovery document, present only on failure
    pub recovery_sql: Option<String>,
}

/// Executes charset conversions with the FK drop/convert/recreate sequence
pub struct FkSafeCharsetChanger<'a> {
    conn: &'a dyn Connection,
    graph: &'a RelationshipGraph,
    schema: String,
}

impl<'a> FkSafeCharsetChanger<'a> {
    pub fn new(conn: &'a dyn Connection, graph: &'a RelationshipGraph, schema: &str) -> Self {
        Self {
            conn,
            graph,
            schema: schema.to_string(),
        }
    }

    /// Generate the three-phase script without executing anything
    pub async fn generate_script(
        &self,
        tables: &IndexSet<String>,
        charset: &str,
        collation: &str,
    ) -> Result<SafeChangeScript> {
        let fks = self.load_fks(tables).await?;
        Ok(self.build_script(&fks, tables, charset, collation))
    }

    async fn load_fks(&self, tables: &IndexSet<String>) -> Result<Vec<ForeignKeyDefinition>> {
        let table_list: Vec<String> = tables.iter().cloned().collect();
        load_related_foreign_keys(self.conn, &self.schema, &table_list).await
    }

    fn build_script(
        &self,
        fks: &[ForeignKeyDefinition],
        tables: &IndexSet<String>,
        charset: &str,
        collation: &str,
    ) -> SafeChangeScript {
        let ordered = self.graph.topological_order(tables);
        SafeChangeScript {
            drop_fks: fks.iter().map(|fk| fk.drop_sql(&self.schema)).collect(),
            alter_tables: ordered
                .iter()
                .map(|table| {
                    format!(
                        "ALTER TABLE `{}`.`{table}` CONVERT TO CHARACTER SET {charset} COLLATE {collation};",
                        self.schema
                    )
                })
                .collect(),
            add_fks: fks.iter().map(|fk| fk.add_sql(&self.schema)).collect(),
        }
    }

    /// Run the three phases against the live connection.
    ///
    /// On failure the dropped-but-not-restored FKs are replayed from the
    /// rollback stack (newest first), and a recovery document is produced
    /// whether or not that replay succeeds.
    pub async fn execute(
        &self,
        tables: &IndexSet<String>,
        charset: &str,
        collation: &str,
        progress: &dyn ProgressSink,
        cancel: &CancelFlag,
    ) -> Result<SafeChangeOutcome> {
        let fks = self.load_fks(tables).await?;
        let script = self.build_script(&fks, tables, charset, collation);

        debug!(
            schema = %self.schema,
            tables = script.table_count(),
            foreign_keys = script.fk_count(),
            "starting fk-safe charset change"
        );

        // FK re-add statements for everything dropped so far, LIFO
        let mut rollback_stack: Vec<String> = Vec::new();
        let mut executed_drop = Vec::new();
        let mut executed_alter = Vec::new();
        let mut executed_add = Vec::new();
        let mut skipped_views = Vec::new();

        let run = self
            .run_phases(
                &script,
                &fks,
                &mut rollback_stack,
                &mut executed_drop,
                &mut executed_alter,
                &mut executed_add,
                &mut skipped_views,
                progress,
                cancel,
            )
            .await;

        match run {
            Ok(()) => {
                if skipped_views.is_empty() {
                    progress.on_message("fk-safe charset change complete");
                } else {
                    progress.on_message(&format!(
                        "fk-safe charset change complete ({} views skipped)",
                        skipped_views.len()
                    ));
                }
                Ok(SafeChangeOutcome {
                    success: true,
                    message: "charset change complete".to_string(),
                    executed_drop,
                    executed_alter,
                    executed_add,
                    skipped_views,
                    auto_recovered: false,
                    recovery_sql: None,
                })
            }
            Err(err) => {
                let _ = self.conn.rollback().await;
                warn!(schema = %self.schema, error = %err, "fk-safe charset change failed");
                progress.on_message(&format!("charset change failed: {err}"));

                let mut recovery_errors: Vec<String> = Vec::new();
                let attempted = !rollback_stack.is_empty();
                if attempted {
                    progress.on_message("attempting automatic fk restoration");
                    for sql in rollback_stack.iter().rev() {
                        if let Err(restore_err) = self.conn.execute(sql).await {
                            recovery_errors.push(format!("{sql}: {restore_err}"));
                        }
                    }
                    let _ = self.conn.commit().await;
                }
                let auto_recovered = attempted && recovery_errors.is_empty();

                let recovery_sql = build_recovery_sql(
                    &self.schema,
                    &rollback_stack,
                    &executed_drop,
                    &executed_alter,
                    &executed_add,
                    &err.to_string(),
                );

                Ok(SafeChangeOutcome {
                    success: false,
                    message: err.to_string(),
                    executed_drop,
                    executed_alter,
                    executed_add,
                    skipped_views,
                    auto_recovered,
                    recovery_sql: Some(recovery_sql),
                })
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_phases(
        &self,
        script: &SafeChangeScript,
        fks: &[ForeignKeyDefinition],
        rollback_stack: &mut Vec<String>,
        executed_drop: &mut Vec<String>,
        executed_alter: &mut Vec<String>,
        executed_add: &mut Vec<String>,
        skipped_views: &mut Vec<String>,
        progress: &dyn ProgressSink,
        cancel: &CancelFlag,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(UpliftError::Cancelled);
        }

        progress.on_phase("drop_foreign_keys");
        for (fk, sql) in fks.iter().zip(&script.drop_fks) {
            progress.on_message(sql);
            self.conn.execute(sql).await?;
            executed_drop.push(sql.clone());
            rollback_stack.push(fk.add_sql(&self.schema));
        }
        self.conn.commit().await?;

        if cancel.is_cancelled() {
            return Err(UpliftError::Cancelled);
        }

        progress.on_phase("convert_charset");
        for sql in &script.alter_tables {
            progress.on_message(sql);
            match self.conn.execute(sql).await {
                Ok(_) => executed_alter.push(sql.clone()),
                Err(err) if err.is_not_base_table() => {
                    debug!(statement = %sql, "skipping view during charset conversion");
                    skipped_views.push(sql.clone());
                }
                Err(err) => return Err(err),
            }
        }
        self.conn.commit().await?;

        if cancel.is_cancelled() {
            return Err(UpliftError::Cancelled);
        }

        progress.on_phase("recreate_foreign_keys");
        for sql in &script.add_fks {
            progress.on_message(sql);
            self.conn.execute(sql).await?;
            executed_add.push(sql.clone());
            rollback_stack.retain(|entry| entry != sql);
        }
        self.conn.commit().await?;

        Ok(())
    }
}

/// Render the manual recovery document for a failed safe change
fn build_recovery_sql(
    schema: &str,
    rollback_stack: &[String],
    executed_drop: &[String],
    executed_alter: &[String],
    executed_add: &[String],
    error: &str,
) -> String {
    let mut lines = Vec::new();
    let rule = format!("-- {}", "=".repeat(60));
    lines.push(rule.clone());
    lines.push("-- Migration recovery SQL (auto-generated)".to_string());
    lines.push(format!("-- Schema: {schema}"));
    lines.push(format!("-- Generated: {}", chrono::Utc::now().to_rfc3339()));
    lines.push(format!("-- Error: {error}"));
    lines.push(rule);
    lines.push(String::new());
    lines.push("-- Running this SQL restores the pre-change state.".to_string());
    lines.push("-- Execute the statements in order.".to_string());
    lines.push(String::new());

    if !rollback_stack.is_empty() {
        lines.push("-- ===== recreate dropped foreign keys =====".to_string());
        lines.extend(rollback_stack.iter().rev().cloned());
        lines.push(String::new());
    }

    lines.push("-- ===== execution summary =====".to_string());
    lines.push(format!("-- FK drops executed: {}", executed_drop.len()));
    lines.push(format!("-- charset changes executed: {}", executed_alter.len()));
    lines.push(format!("-- FK re-adds executed: {}", executed_add.len()));
    lines.push(format!("-- FKs still missing: {}", rollback_stack.len()));

    lines.iter().join("\n")
}
