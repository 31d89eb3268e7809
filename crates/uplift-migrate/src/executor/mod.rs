//! Batch execution of planned fix steps
//!
//! The executor takes the planned steps after selection, resorts charset
//! work into FK order, and dispatches each step. Session state it mutates
//! (`FOREIGN_KEY_CHECKS`, `sql_mode`) is wrapped in a guard restored on
//! every exit path. Dry-run mode never executes DDL/DML; it estimates row
//! counts instead.

use indexmap::{IndexMap, IndexSet};
use tracing::{debug, warn};

use uplift_core::{CancelFlag, Connection, IssueKind, ProgressSink, Result};
use uplift_schema::{MetadataCache, RelationshipGraph};

use crate::options::{FixStrategy, PlannedStep};
use crate::rollback::RollbackScriptBuilder;
use crate::safe_change::FkSafeCharsetChanger;
use crate::{TARGET_CHARSET, TARGET_COLLATION};


/// Outcome of one dispatched step
#[derive(Debug, Clone)]
pub struct StepResult {
    pub success: bool,
    pub message: String,
    pub sql_executed: String,
    pub affected_rows: u64,
    pub error: Option<String>,
    /// Step location, carried here so FK resorting cannot misalign results
    pub location: String,
    pub description: String,
}

impl StepResult {
    fn ok(message: &str, sql: &str, affected_rows: u64) -> Self {
        Self {
            success: true,
            message: message.to_string(),
            sql_executed: sql.to_string(),
            affected_rows,
            error: None,
            location: String::new(),
            description: String::new(),
        }
    }

    fn failed(message: &str, sql: &str, error: &str) -> Self {
        Self {
            success: false,
            message: message.to_string(),
            sql_executed: sql.to_string(),
            affected_rows: 0,
            error: Some(error.to_string()),
            location: String::new(),
            description: String::new(),
        }
    }
}

/// Aggregated batch outcome, including the consolidated rollback script
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    pub total_steps: usize,
    pub success_count: usize,
    pub fail_count: usize,
    pub skip_count: usize,
    pub results: Vec<StepResult>,
    pub total_affected_rows: u64,
    pub rollback_sql: String,
}

/// Session state touched for the batch; restored through `restore` on
/// every exit path. Drop cannot await, so restoration is explicit.
struct SessionGuard {
    original_sql_mode: Option<String>,
    fk_checks_disabled: bool,
}

impl SessionGuard {
    async fn acquire(conn: &dyn Connection, disable_fk_checks: bool) -> Self {
        let original_sql_mode = match conn.query("SELECT @@SESSION.sql_mode AS sql_mode").await {
            Ok(result) => result
                .first()
                .and_then(|row| row.get_str("sql_mode"))
                .map(String::from),
            Err(err) => {
                warn!(error = %err, "could not read sql_mode, skipping relaxation");
                None
            }
        };

        // Zero dates trip strict mode (errors 1292/1525) during comparisons
        // and conversions
        if original_sql_mode.is_some() {
            if let Err(err) = conn.execute("SET SESSION sql_mode = ''").await {
                warn!(error = %err, "could not relax sql_mode");
            }
        }

        let mut fk_checks_disabled = false;
        if disable_fk_checks {
            match conn.execute("SET FOREIGN_KEY_CHECKS = 0").await {
                Ok(_) => {
                    let _ = conn.commit().await;
                    fk_checks_disabled = true;
                }
                Err(err) => warn!(error = %err, "could not disable FOREIGN_KEY_CHECKS"),
            }
        }

        Self {
            original_sql_mode,
            fk_checks_disabled,
        }
    }

    async fn restore(self, conn: &dyn Connection) {
        if let Some(mode) = &self.original_sql_mode {
            if let Err(err) = conn
                .execute(&format!("SET SESSION sql_mode = '{mode}'"))
                .await
            {
                warn!(error = %err, "could not restore sql_mode");
            }
        }
        if self.fk_checks_disabled {
            match conn.execute("SET FOREIGN_KEY_CHECKS = 1").await {
                Ok(_) => {
                    let _ = conn.commit().await;
                }
                Err(err) => warn!(error = %err, "could not restore FOREIGN_KEY_CHECKS"),
            }
        }
    }
}

/// Dispatches a batch of planned steps against one session
pub struct BatchExecutor<'a> {
    conn: &'a dyn Connection,
    graph: &'a RelationshipGraph,
    metadata: &'a MetadataCache,
    schema: String,
}

impl<'a> BatchExecutor<'a> {
    pub fn new(
        conn: &'a dyn Connection,
        graph: &'a RelationshipGraph,
        metadata: &'a MetadataCache,
        schema: &str,
    ) -> Self {
        Self {
            conn,
            graph,
            metadata,
            schema: schema.to_string(),
        }
    }

    /// Execute (or dry-run) the batch.
    ///
    /// A failing step does not abort the batch; independent steps continue
    /// and the rollback script still covers everything that did change.
    pub async fn execute_batch(
        &self,
        steps: &[PlannedStep],
        dry_run: bool,
        progress: &dyn ProgressSink,
        cancel: &CancelFlag,
    ) -> Result<BatchResult> {
        let mode = if dry_run { "[dry-run]" } else { "[execute]" };
        progress.on_message(&format!("{mode} starting batch of {} steps", steps.len()));
        debug!(steps = steps.len(), dry_run, "starting batch");

        let rollback_builder = RollbackScriptBuilder::new(self.conn, self.metadata, &self.schema);
        let pre_states = if dry_run {
            IndexMap::new()
        } else {
            rollback_builder.capture_pre_states(steps).await?
        };

        let has_charset = has_unmanaged_charset_steps(steps);
        let sorted;
        let steps: &[PlannedStep] = if has_charset {
            sorted = self.sort_steps_by_fk_order(steps);
            &sorted
        } else {
            steps
        };

        let guard = if dry_run {
            None
        } else {
            Some(SessionGuard::acquire(self.conn, has_charset).await)
        };

        let mut batch = BatchResult {
            total_steps: steps.len(),
            ..Default::default()
        };
        self.run_steps(steps, dry_run, progress, cancel, &mut batch)
            .await;

        if let Some(guard) = guard {
            guard.restore(self.conn).await;
        }

        if !dry_run && !pre_states.is_empty() {
            batch.rollback_sql = match rollback_builder.build(steps, &pre_states).await {
                Ok(script) => script,
                Err(err) => {
                    warn!(error = %err, "rollback script generation failed");
                    format!("-- rollback script generation failed: {err}")
                }
            };
        }

        debug!(
            success = batch.success_count,
            failed = batch.fail_count,
            skipped = batch.skip_count,
            "batch finished"
        );
        Ok(batch)
    }

    async fn run_steps(
        &self,
        steps: &[PlannedStep],
        dry_run: bool,
        progress: &dyn ProgressSink,
        cancel: &CancelFlag,
        batch: &mut BatchResult,
    ) {
        let mut handled: IndexSet<String> = IndexSet::new();

        self.run_fk_safe_clusters(steps, dry_run, progress, cancel, &mut handled, batch)
            .await;
        self.run_merged_column_conversions(steps, dry_run, progress, cancel, &mut handled, batch)
            .await;

        let total = steps.len();
        for (index, step) in steps.iter().enumerate() {
            if cancel.is_cancelled() {
                progress.on_message("batch cancelled");
                break;
            }
            if handled.contains(&step.location) {
                continue;
            }
            // Folded-in steps: their SQL is owned by the step that
            // cascaded them in
            if step.included_by.is_some() {
                continue;
            }

            let Some(option) = &step.selected_option else {
                continue;
            };

            if option.strategy.is_skip() {
                progress.on_step_started(index, total, &step.location);
                let mut result = StepResult::ok("skipped", "", 0);
                result.location = step.location.clone();
                result.description = step.description.clone();
                batch.results.push(result);
                batch.skip_count += 1;
                progress.on_step_finished(index, total, true);
                continue;
            }

            let sql = step.render_sql();
            if sql.is_empty() || sql.starts_with("--") {
                let description = if option.description.is_empty() {
                    step.description.clone()
                } else {
                    option.description.clone()
                };
                progress.on_step_started(index, total, &step.location);
                let mut result = StepResult::ok("manual action required", &sql, 0);
                result.location = step.location.clone();
                result.description = description;
                batch.results.push(result);
                batch.skip_count += 1;
                progress.on_step_finished(index, total, true);
                continue;
            }

            progress.on_step_started(index, total, &step.location);
            let mut result = if dry_run {
                self.estimate_affected_rows(&sql).await
            } else {
                self.execute_single(&sql).await
            };
            result.location = step.location.clone();
            result.description = step.description.clone();

            progress.on_step_finished(index, total, result.success);
            if result.success {
                batch.success_count += 1;
                batch.total_affected_rows += result.affected_rows;
            } else {
                batch.fail_count += 1;
            }
            batch.results.push(result);
        }
    }

    /// FK-safe steps sharing one related-table cluster run the three-phase
    /// change once per cluster, not once per step
    async fn run_fk_safe_clusters(
        &self,
        steps: &[PlannedStep],
        dry_run: bool,
        progress: &dyn ProgressSink,
        cancel: &CancelFlag,
        handled: &mut IndexSet<String>,
        batch: &mut BatchResult,
    ) {
        let mut clusters: IndexMap<Vec<String>, Vec<&PlannedStep>> = IndexMap::new();
        for step in steps {
            let Some(option) = &step.selected_option else {
                continue;
            };
            if option.strategy != FixStrategy::CharsetFkSafe {
                continue;
            }
            let mut key = option.related_tables.clone();
            key.sort();
            clusters.entry(key).or_default().push(step);
        }
        if clusters.is_empty() {
            return;
        }

        progress.on_message(&format!(
            "fk-safe batch: {} clusters",
            clusters.len()
        ));

        for (tables, cluster_steps) in clusters {
            if cancel.is_cancelled() {
                progress.on_message("batch cancelled");
                return;
            }
            let table_set: IndexSet<String> = tables.iter().cloned().collect();
            let changer = FkSafeCharsetChanger::new(self.conn, self.graph, &self.schema);

            let (success, message) = if dry_run {
                match changer
                    .generate_script(&table_set, TARGET_CHARSET, TARGET_COLLATION)
                    .await
                {
                    Ok(script) => (
                        true,
                        format!(
                            "[dry-run] would convert {} tables, {} FKs",
                            script.table_count(),
                            script.fk_count()
                        ),
                    ),
                    Err(err) => (false, err.to_string()),
                }
            } else {
                match changer
                    .execute(
                        &table_set,
                        TARGET_CHARSET,
                        TARGET_COLLATION,
                        progress,
                        cancel,
                    )
                    .await
                {
                    Ok(outcome) if outcome.success => (true, "fk-safe change complete".to_string()),
                    Ok(outcome) => {
                        let mut message = format!("fk-safe change failed: {}", outcome.message);
                        if let Some(recovery) = &outcome.recovery_sql {
                            message.push_str("\nrecovery SQL:\n");
                            message.push_str(recovery);
                        }
                        (false, message)
                    }
                    Err(err) => (false, err.to_string()),
                }
            };

            for step in cluster_steps {
                handled.insert(step.location.clone());
                let template = step
                    .selected_option
                    .as_ref()
                    .and_then(|o| o.sql_template.clone())
                    .unwrap_or_default();
                let mut result = if success {
                    StepResult::ok(&message, &template, 1)
                } else {
                    StepResult::failed(&message, &template, &message)
                };
                result.location = step.location.clone();
                result.description = step.description.clone();
                batch.results.push(result);
                if success {
                    batch.success_count += 1;
                    batch.total_affected_rows += 1;
                } else {
                    batch.fail_count += 1;
                }
            }
        }
    }

    /// Several column-level conversions on one table merge into a single
    /// multi-clause ALTER; on merge failure each step falls back to its own
    /// statement
    async fn run_merged_column_conversions(
        &self,
        steps: &[PlannedStep],
        dry_run: bool,
        progress: &dyn ProgressSink,
        cancel: &CancelFlag,
        handled: &mut IndexSet<String>,
        batch: &mut BatchResult,
    ) {
        let mut groups: IndexMap<String, Vec<&PlannedStep>> = IndexMap::new();
        for step in steps {
            let Some(option) = &step.selected_option else {
                continue;
            };
            let column_level = step.column_name().is_some();
            if option.strategy == FixStrategy::CharsetSingle
                && option.modify_clause.is_some()
                && column_level
            {
                if let Some(table) = step.table_name() {
                    groups.entry(table.to_string()).or_default().push(step);
                }
            }
        }

        for (table, group) in groups {
            if cancel.is_cancelled() {
                return;
            }
            if group.len() < 2 {
                continue;
            }

            let clauses: Vec<String> = group
                .iter()
                .filter_map(|step| {
                    let clause = step.selected_option.as_ref()?.modify_clause.as_ref()?;
                    Some(format!("MODIFY COLUMN {clause}"))
                })
                .collect();
            if clauses.len() < 2 {
                continue;
            }

            let merged_sql = format!(
                "ALTER TABLE `{}`.`{table}`\n  {};",
                self.schema,
                clauses.join(",\n  ")
            );
            progress.on_message(&format!(
                "merging {} column conversions on `{table}` into one ALTER",
                clauses.len()
            ));

            let merge_result = if dry_run {
                self.estimate_affected_rows(&merged_sql).await
            } else {
                self.execute_single(&merged_sql).await
            };

            if !merge_result.success && !dry_run {
                progress.on_message(&format!(
                    "merged ALTER failed, falling back to per-column statements: {}",
                    merge_result.message
                ));
                for step in group {
                    let sql = step.render_sql();
                    let mut result = self.execute_single(&sql).await;
                    result.location = step.location.clone();
                    result.description = step.description.clone();
                    if result.success {
                        batch.success_count += 1;
                        batch.total_affected_rows += result.affected_rows;
                    } else {
                        batch.fail_count += 1;
                    }
                    batch.results.push(result);
                    handled.insert(step.location.clone());
                }
                continue;
            }

            for (index, step) in group.iter().enumerate() {
                let mut result = StepResult {
                    success: merge_result.success,
                    message: format!("{} (merged: {} columns)", merge_result.message, clauses.len()),
                    sql_executed: if index == 0 {
                        merged_sql.clone()
                    } else {
                        format!("-- merged into the `{table}` ALTER")
                    },
                    affected_rows: if index == 0 { merge_result.affected_rows } else { 0 },
                    error: merge_result.error.clone(),
                    location: step.location.clone(),
                    description: step.description.clone(),
                };
                if result.success {
                    batch.success_count += 1;
                    if index == 0 {
                        batch.total_affected_rows += result.affected_rows;
                    }
                } else {
                    batch.fail_count += 1;
                    result.affected_rows = 0;
                }
                batch.results.push(result);
                handled.insert(step.location.clone());
            }
        }
    }

    /// Charset steps are resorted so parent tables convert before children;
    /// everything else keeps its original order after them
    fn sort_steps_by_fk_order(&self, steps: &[PlannedStep]) -> Vec<PlannedStep> {
        let charset_steps: Vec<&PlannedStep> =
            steps.iter().filter(|s| s.kind == IssueKind::Charset).collect();
        let other_steps = steps.iter().filter(|s| s.kind != IssueKind::Charset);

        if charset_steps.is_empty() {
            return steps.to_vec();
        }

        let mut table_to_steps: IndexMap<String, Vec<&PlannedStep>> = IndexMap::new();
        for step in &charset_steps {
            let table = step.table_name().unwrap_or(&step.location).to_string();
            table_to_steps.entry(table).or_default().push(step);
        }

        let tables: IndexSet<String> = table_to_steps.keys().cloned().collect();
        let ordered = self.graph.topological_order(&tables);

        let mut sorted: Vec<PlannedStep> = Vec::with_capacity(steps.len());
        for table in &ordered {
            if let Some(group) = table_to_steps.get(table) {
                sorted.extend(group.iter().map(|s| (*s).clone()));
            }
        }
        sorted.extend(other_steps.cloned());
        sorted
    }

    /// Execute one possibly multi-statement template; statements targeting
    /// views are skipped, any other error fails the step after a rollback
    async fn execute_single(&self, sql: &str) -> StepResult {
        let statements: Vec<&str> = sql
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty() && !s.starts_with("--"))
            .collect();

        let mut total_affected = 0u64;
        let mut skipped_views = 0usize;
        for statement in statements {
            match self.conn.execute(statement).await {
                Ok(outcome) => total_affected += outcome.affected_rows,
                Err(err) if err.is_not_base_table() => skipped_views += 1,
                Err(err) => {
                    let _ = self.conn.rollback().await;
                    return StepResult::failed(
                        &format!("execution failed: {err}"),
                        sql,
                        &err.to_string(),
                    );
                }
            }
        }
        if let Err(err) = self.conn.commit().await {
            return StepResult::failed(&format!("commit failed: {err}"), sql, &err.to_string());
        }

        let message = if skipped_views > 0 {
            format!("executed ({skipped_views} views skipped)")
        } else {
            "executed".to_string()
        };
        StepResult::ok(&message, sql, total_affected)
    }

    /// Dry-run estimation: UPDATE-with-WHERE becomes a COUNT query, DDL is
    /// reported as not estimable
    async fn estimate_affected_rows(&self, sql: &str) -> StepResult {
        let upper = sql.to_uppercase();

        if upper.contains("UPDATE") && upper.contains("WHERE") {
            let Some(count_sql) = rewrite_update_to_count(sql) else {
                return StepResult::ok("[dry-run] analyzed", sql, 0);
            };

            match self.conn.query(&count_sql).await {
                Ok(result) => {
                    let affected = result
                        .first()
                        .and_then(|row| row.get_i64("cnt"))
                        .unwrap_or(0)
                        .max(0) as u64;
                    StepResult::ok(
                        &format!("[dry-run] estimated affected rows: {affected}"),
                        sql,
                        affected,
                    )
                }
                // Strict mode can reject the comparison against zero dates;
                // the count is unknown but at least one row matched detection
                Err(_) => StepResult::ok(
                    "[dry-run] estimated affected rows: at least 1 (count query rejected)",
                    sql,
                    1,
                ),
            }
        } else if upper.contains("ALTER") {
            StepResult::ok("[dry-run] DDL statement, row estimate not available", sql, 0)
        } else {
            StepResult::ok("[dry-run] analyzed", sql, 0)
        }
    }
}

/// Whether the batch needs FOREIGN_KEY_CHECKS suspended: any charset step
/// except skips and FK-safe changes (which manage FKs themselves)
fn has_unmanaged_charset_steps(steps: &[PlannedStep]) -> bool {
    steps.iter().any(|step| {
        step.kind == IssueKind::Charset
            && step.selected_option.as_ref().is_some_and(|o| {
                !matches!(o.strategy, FixStrategy::Skip | FixStrategy::CharsetFkSafe)
            })
    })
}

/// Rewrite `UPDATE <table> SET ... WHERE <cond>` into
/// `SELECT COUNT(*) AS cnt FROM <table> WHERE <cond>`
fn rewrite_update_to_count(sql: &str) -> Option<String> {
    let upper = sql.to_uppercase();
    let update_idx = upper.find("UPDATE")?;
    let set_idx = upper.find(" SET ").or_else(|| upper.find("\nSET "))?;
    let where_idx = upper.find("WHERE")?;
    if set_idx <= update_idx || where_idx <= set_idx {
        return None;
    }

    let table_part = sql[update_idx + "UPDATE".len()..set_idx].trim();
    let where_clause = sql[where_idx..].trim_end().trim_end_matches(';');
    Some(format!(
        "SELECT COUNT(*) AS cnt FROM {table_part} {where_clause}"
    ))
}
