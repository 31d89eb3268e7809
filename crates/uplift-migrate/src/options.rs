//! Fix strategies, candidate options, and per-issue option generation

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use tracing::debug;

use uplift_core::{CompatibilityIssue, Connection, IssueKind, Result};
use uplift_schema::{MetadataCache, RelationshipGraph};

use crate::safe_change::FkSafeCharsetChanger;
use crate::{TARGET_CHARSET, TARGET_COLLATION};

/// The closed set of remediation strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixStrategy {
    /// Rewrite invalid dates to NULL
    DateToNull,
    /// Rewrite invalid dates to 1970-01-01
    DateToMin,
    /// Rewrite invalid dates to a user-supplied date
    DateToCustom,
    /// Convert one table or column only
    CharsetSingle,
    /// Convert all FK-related tables under FOREIGN_KEY_CHECKS=0
    CharsetFkCascade,
    /// Drop FKs, convert, recreate FKs
    CharsetFkSafe,
    /// Leave the issue as is
    Skip,
    /// Requires human action outside the engine
    Manual,
}

impl FixStrategy {
    pub fn is_skip(&self) -> bool {
        matches!(self, FixStrategy::Skip)
    }

    pub fn is_manual(&self) -> bool {
        matches!(self, FixStrategy::Manual)
    }

    pub fn is_charset(&self) -> bool {
        matches!(
            self,
            FixStrategy::CharsetSingle | FixStrategy::CharsetFkCascade | FixStrategy::CharsetFkSafe
        )
    }
}

/// One candidate remediation for an issue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixOption {
    pub strategy: FixStrategy,
    pub label: String,
    pub description: String,
    pub sql_template: Option<String>,
    pub requires_input: bool,
    pub input_label: Option<String>,
    pub input_default: Option<String>,
    pub is_recommended: bool,
    /// Tables covered by a cascade strategy, in topological order
    pub related_tables: Vec<String>,
    /// Structured `MODIFY COLUMN` clause for column-level charset fixes,
    /// used to merge several column steps into one ALTER
    pub modify_clause: Option<String>,
}

impl FixOption {
    fn new(strategy: FixStrategy, label: &str, description: &str) -> Self {
        Self {
            strategy,
            label: label.to_string(),
            description: description.to_string(),
            sql_template: None,
            requires_input: false,
            input_label: None,
            input_default: None,
            is_recommended: false,
            related_tables: Vec::new(),
            modify_clause: None,
        }
    }

    fn with_sql(mut self, sql: String) -> Self {
        self.sql_template = Some(sql);
        self
    }

    fn recommended(mut self, recommended: bool) -> Self {
        self.is_recommended = recommended;
        self
    }
}

/// One issue bound to its generated options and, later, a selection.
///
/// `included_by` marks steps folded into another step's cascade batch; such
/// steps are never dispatched independently.
#[derive(Debug, Clone)]
pub struct PlannedStep {
    pub issue_index: usize,
    pub kind: IssueKind,
    pub location: String,
    pub description: String,
    pub options: Vec<FixOption>,
    pub selected_option: Option<FixOption>,
    pub user_input: Option<String>,
    pub included_by: Option<String>,
    pub included_reason: String,
}

impl PlannedStep {
    /// Table name parsed from the dotted location
    pub fn table_name(&self) -> Option<&str> {
        let mut parts = self.location.split('.');
        let first = parts.next()?;
        parts.next().or(Some(first))
    }

    /// Column name, present only for column-level locations
    pub fn column_name(&self) -> Option<&str> {
        self.location.split('.').nth(2)
    }

    /// Render the selected option's SQL with user input substituted
    pub fn render_sql(&self) -> String {
        let Some(option) = &self.selected_option else {
            return String::new();
        };
        let mut sql = option.sql_template.clone().unwrap_or_default();
        if option.requires_input {
            if let Some(input) = &self.user_input {
                sql = sql.replace("{custom_date}", input);
                sql = sql.replace("{precision}", input);
            }
        }
        sql
    }
}

/// Generates the candidate fix options for each issue kind.
///
/// Dispatch is an exhaustive match on `IssueKind`; a Skip option is always
/// appended so every list has a terminal choice.
pub struct FixOptionCatalog<'a> {
    conn: &'a dyn Connection,
    graph: &'a RelationshipGraph,
    metadata: &'a MetadataCache,
    schema: String,
}

impl<'a> FixOptionCatalog<'a> {
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

    /// Build the planned step list for a slice of issues, options included
    pub async fn plan_steps(&self, issues: &[CompatibilityIssue]) -> Result<Vec<PlannedStep>> {
        let mut steps = Vec::with_capacity(issues.len());
        for (index, issue) in issues.iter().enumerate() {
            let options = self.options_for(issue).await?;
            steps.push(PlannedStep {
                issue_index: index,
                kind: issue.kind,
                location: issue.location.clone(),
                description: issue.description.clone(),
                options,
                selected_option: None,
                user_input: None,
                included_by: None,
                included_reason: String::new(),
            });
        }
        debug!(issues = issues.len(), "planned wizard steps");
        Ok(steps)
    }

    /// Candidate options for one issue
    pub async fn options_for(&self, issue: &CompatibilityIssue) -> Result<Vec<FixOption>> {
        let mut options = match issue.kind {
            IssueKind::InvalidDate => self.date_options(issue).await?,
            IssueKind::Charset => self.charset_options(issue).await?,
            IssueKind::Zerofill => self.zerofill_options(),
            IssueKind::FloatPrecision => self.float_precision_options(issue),
            IssueKind::IntDisplayWidth => self.int_display_width_options(),
            IssueKind::EnumEmpty => self.enum_empty_options(),
            IssueKind::DeprecatedEngine => self.deprecated_engine_options(issue),
            IssueKind::TimestampRange
            | IssueKind::ReservedKeyword
            | IssueKind::AuthPlugin
            | IssueKind::SuperPrivilege
            | IssueKind::RemovedSysVar
            | IssueKind::GroupbyAscDesc
            | IssueKind::SqlCalcFoundRows
            | IssueKind::Partition
            | IssueKind::BlobTextDefault
            | IssueKind::FkNameLength => self.manual_only(issue),
        };

        options.push(FixOption::new(
            FixStrategy::Skip,
            "Skip",
            "Leave this issue unfixed.",
        ));
        Ok(options)
    }

    async fn date_options(&self, issue: &CompatibilityIssue) -> Result<Vec<FixOption>> {
        let (Some(table), Some(column)) = (issue.table_name.as_deref(), issue.column_name.as_deref())
        else {
            return Ok(self.manual_only(issue));
        };

        let nullable = self.metadata.is_nullable(self.conn, table, column).await?;
        let predicate = format!(
            "WHERE `{column}` = '0000-00-00'\n   OR `{column}` = '0000-00-00 00:00:00'\n   OR (MONTH(`{column}`) = 0 OR DAY(`{column}`) = 0);"
        );

        let mut options = Vec::new();
        if nullable {
            options.push(
                FixOption::new(
                    FixStrategy::DateToNull,
                    "Set to NULL (recommended)",
                    "Rewrites zero dates to NULL.",
                )
                .with_sql(format!(
                    "UPDATE `{}`.`{table}`\nSET `{column}` = NULL\n{predicate}",
                    self.schema
                ))
                .recommended(true),
            );
        }

        options.push(
            FixOption::new(
                FixStrategy::DateToMin,
                "Set to 1970-01-01",
                "Rewrites zero dates to the Unix epoch date.",
            )
            .with_sql(format!(
                "UPDATE `{}`.`{table}`\nSET `{column}` = '1970-01-01'\n{predicate}",
                self.schema
            ))
            .recommended(!nullable),
        );

        let mut custom = FixOption::new(
            FixStrategy::DateToCustom,
            "Set to a custom date",
            "Rewrites zero dates to a date you choose.",
        )
        .with_sql(format!(
            "UPDATE `{}`.`{table}`\nSET `{column}` = '{{custom_date}}'\n{predicate}",
            self.schema
        ));
        custom.requires_input = true;
        custom.input_label = Some("Replacement date (YYYY-MM-DD)".to_string());
        custom.input_default = Some("2000-01-01".to_string());
        options.push(custom);

        Ok(options)
    }

    async fn charset_options(&self, issue: &CompatibilityIssue) -> Result<Vec<FixOption>> {
        let parts: Vec<&str> = issue.location.split('.').collect();
        if parts.len() < 2 {
            return Ok(self.manual_only(issue));
        }
        let table = parts[1];
        let column = parts.get(2).copied();

        if let Some(column) = column {
            return self.column_charset_options(table, column).await;
        }

        let mut options = Vec::new();
        options.push(
            FixOption::new(
                FixStrategy::CharsetSingle,
                "Convert this table only",
                &format!("Converts only `{table}` to {TARGET_CHARSET}."),
            )
            .with_sql(format!(
                "ALTER TABLE `{}`.`{table}` CONVERT TO CHARACTER SET {TARGET_CHARSET} COLLATE {TARGET_COLLATION};",
                self.schema
            )),
        );

        let related = self.graph.related_tables(table);
        if !related.is_empty() {
            let mut all_tables: IndexSet<String> = IndexSet::new();
            all_tables.insert(table.to_string());
            all_tables.extend(related);
            let ordered = self.graph.topological_order(&all_tables);

            let mut cascade_lines = vec!["SET FOREIGN_KEY_CHECKS = 0;".to_string()];
            for t in &ordered {
                cascade_lines.push(format!(
                    "ALTER TABLE `{}`.`{t}` CONVERT TO CHARACTER SET {TARGET_CHARSET} COLLATE {TARGET_COLLATION};",
                    self.schema
                ));
            }
            cascade_lines.push("SET FOREIGN_KEY_CHECKS = 1;".to_string());

            let mut cascade = FixOption::new(
                FixStrategy::CharsetFkCascade,
                &format!("Convert all FK-related tables ({})", ordered.len()),
                &format!(
                    "Converts every FK-connected table to {TARGET_CHARSET}: {}",
                    ordered.join(", ")
                ),
            )
            .with_sql(cascade_lines.join("\n"));
            cascade.related_tables = ordered.clone();
            options.push(cascade);

            let changer = FkSafeCharsetChanger::new(self.conn, self.graph, &self.schema);
            let script = changer
                .generate_script(&all_tables, TARGET_CHARSET, TARGET_COLLATION)
                .await?;

            let mut safe = FixOption::new(
                FixStrategy::CharsetFkSafe,
                &format!(
                    "FK-safe conversion ({} tables, {} FKs)",
                    script.table_count(),
                    script.fk_count()
                ),
                &format!(
                    "Avoids Error 3780 by dropping FKs, converting, then recreating them. Tables: {}",
                    ordered.join(", ")
                ),
            )
            .with_sql(script.full_sql())
            .recommended(true);
            safe.related_tables = ordered;
            options.push(safe);
        }

        Ok(options)
    }

    async fn column_charset_options(&self, table: &str, column: &str) -> Result<Vec<FixOption>> {
        let definition = self
            .metadata
            .column_definition(
                self.conn,
                table,
                column,
                Some(TARGET_CHARSET),
                Some(TARGET_COLLATION),
            )
            .await?;

        let Some(definition) = definition else {
            // Never guess a column definition: an incorrect MODIFY COLUMN
            // silently rewrites the type
            return Ok(vec![
                FixOption::new(
                    FixStrategy::Manual,
                    "Manual action required",
                    &format!("Could not read the definition of {table}.{column}."),
                )
                .with_sql(format!(
                    "-- verify the column type, then convert manually\n-- SHOW CREATE TABLE `{}`.`{table}`;",
                    self.schema
                )),
            ]);
        };

        let mut option = FixOption::new(
            FixStrategy::CharsetSingle,
            "Convert this column only",
            &format!("Converts {table}.{column} to {TARGET_CHARSET}."),
        )
        .with_sql(format!(
            "ALTER TABLE `{}`.`{table}` MODIFY COLUMN `{column}` {definition};",
            self.schema
        ));
        option.modify_clause = Some(format!("`{column}` {definition}"));
        Ok(vec![option])
    }

    fn zerofill_options(&self) -> Vec<FixOption> {
        vec![
            FixOption::new(
                FixStrategy::Manual,
                "Manual action required",
                "ZEROFILL is deprecated; format in the application with LPAD() instead.",
            )
            .with_sql("-- drop ZEROFILL and format with LPAD() in the application".to_string()),
        ]
    }

    fn float_precision_options(&self, issue: &CompatibilityIssue) -> Vec<FixOption> {
        let (Some(table), Some(column)) = (issue.table_name.as_deref(), issue.column_name.as_deref())
        else {
            return self.manual_only(issue);
        };

        let mut decimal = FixOption::new(
            FixStrategy::Manual,
            "Change to DECIMAL",
            "Use DECIMAL when exact precision is required.",
        )
        .with_sql(format!(
            "ALTER TABLE `{}`.`{table}` MODIFY COLUMN `{column}` DECIMAL({{precision}});",
            self.schema
        ));
        decimal.requires_input = true;
        decimal.input_label = Some("DECIMAL precision (M,D)".to_string());
        decimal.input_default = Some("10,2".to_string());

        vec![
            FixOption::new(
                FixStrategy::Manual,
                "Change to FLOAT",
                "Drops the precision syntax and keeps a plain FLOAT.",
            )
            .with_sql(format!(
                "ALTER TABLE `{}`.`{table}` MODIFY COLUMN `{column}` FLOAT;",
                self.schema
            ))
            .recommended(true),
            decimal,
        ]
    }

    fn int_display_width_options(&self) -> Vec<FixOption> {
        vec![
            FixOption::new(
                FixStrategy::Skip,
                "Ignore (recommended)",
                "Display width is silently ignored from MySQL 8.4 onward.",
            )
            .recommended(true),
        ]
    }

    fn enum_empty_options(&self) -> Vec<FixOption> {
        vec![
            FixOption::new(
                FixStrategy::Manual,
                "Manual action required",
                "Remove the empty string from the ENUM definition after cleaning the data.",
            )
            .with_sql("-- remove '' from the ENUM definition and clean existing rows".to_string()),
        ]
    }

    fn deprecated_engine_options(&self, issue: &CompatibilityIssue) -> Vec<FixOption> {
        let table = issue
            .table_name
            .as_deref()
            .or_else(|| issue.location.split('.').nth(1));
        let Some(table) = table else {
            return self.manual_only(issue);
        };

        vec![
            FixOption::new(
                FixStrategy::Manual,
                "Convert to InnoDB",
                "Switches the table's storage engine to InnoDB.",
            )
            .with_sql(format!(
                "ALTER TABLE `{}`.`{table}` ENGINE=InnoDB;",
                self.schema
            ))
            .recommended(true),
        ]
    }

    fn manual_only(&self, issue: &CompatibilityIssue) -> Vec<FixOption> {
        vec![
            FixOption::new(
                FixStrategy::Manual,
                "Manual action required",
                "No automated fix is available for this issue.",
            )
            .with_sql(format!("-- manual action required: {}", issue.description)),
        ]
    }
}
