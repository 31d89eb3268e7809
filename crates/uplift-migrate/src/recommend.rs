//! Default strategy selection and risk scoring

use tracing::debug;

use uplift_core::{CompatibilityIssue, Connection, IssueKind, Result};
use uplift_schema::{MetadataCache, RelationshipGraph};

use crate::options::{FixOption, FixStrategy, PlannedStep};

/// Static recommendation rule for one issue kind
#[derive(Debug, Clone, Copy)]
pub struct RecommendationRule {
    pub strategy: FixStrategy,
    pub base_risk: u8,
    pub reason: &'static str,
}

/// The per-kind rule table. Invalid-date and charset entries carry the
/// static fallback; both get a dynamic branch in `recommend`.
pub fn rule_for(kind: IssueKind) -> RecommendationRule {
    match kind {
        IssueKind::Charset => RecommendationRule {
            strategy: FixStrategy::CharsetFkSafe,
            base_risk: 20,
            reason: "avoids FK conflicts (Error 3780)",
        },
        IssueKind::InvalidDate => RecommendationRule {
            strategy: FixStrategy::DateToNull,
            base_risk: 30,
            reason: "minimizes data loss",
        },
        IssueKind::IntDisplayWidth => RecommendationRule {
            strategy: FixStrategy::Skip,
            base_risk: 0,
            reason: "silently ignored by MySQL 8.4",
        },
        IssueKind::Zerofill => RecommendationRule {
            strategy: FixStrategy::Manual,
            base_risk: 10,
            reason: "application change needed (LPAD)",
        },
        IssueKind::DeprecatedEngine => RecommendationRule {
            strategy: FixStrategy::Manual,
            base_risk: 40,
            reason: "InnoDB is the supported engine",
        },
        IssueKind::FloatPrecision => RecommendationRule {
            strategy: FixStrategy::Manual,
            base_risk: 15,
            reason: "DECIMAL preserves precision",
        },
        IssueKind::EnumEmpty => RecommendationRule {
            strategy: FixStrategy::Manual,
            base_risk: 10,
            reason: "use NULL or an explicit member",
        },
        IssueKind::TimestampRange => RecommendationRule {
            strategy: FixStrategy::Manual,
            base_risk: 35,
            reason: "convert to DATETIME for post-2038 values",
        },
        IssueKind::ReservedKeyword => RecommendationRule {
            strategy: FixStrategy::Manual,
            base_risk: 25,
            reason: "rename or backtick the identifier",
        },
        IssueKind::AuthPlugin => RecommendationRule {
            strategy: FixStrategy::Manual,
            base_risk: 20,
            reason: "move to caching_sha2_password",
        },
        IssueKind::SuperPrivilege => RecommendationRule {
            strategy: FixStrategy::Manual,
            base_risk: 15,
            reason: "replace with dynamic privileges",
        },
        IssueKind::RemovedSysVar => RecommendationRule {
            strategy: FixStrategy::Manual,
            base_risk: 25,
            reason: "remove the variable from configuration",
        },
        IssueKind::GroupbyAscDesc => RecommendationRule {
            strategy: FixStrategy::Manual,
            base_risk: 10,
            reason: "rewrite with an ORDER BY clause",
        },
        IssueKind::SqlCalcFoundRows => RecommendationRule {
            strategy: FixStrategy::Manual,
            base_risk: 10,
            reason: "rewrite as COUNT(*) plus LIMIT",
        },
        IssueKind::Partition => RecommendationRule {
            strategy: FixStrategy::Manual,
            base_risk: 45,
            reason: "partition layout must be rebuilt",
        },
        IssueKind::BlobTextDefault => RecommendationRule {
            strategy: FixStrategy::Manual,
            base_risk: 10,
            reason: "drop the DEFAULT value",
        },
        IssueKind::FkNameLength => RecommendationRule {
            strategy: FixStrategy::Manual,
            base_risk: 20,
            reason: "shorten the constraint name to 64 chars",
        },
    }
}

/// Aggregated view of a recommendation pass
#[derive(Debug, Clone, Default)]
pub struct RecommendationSummary {
    pub total_issues: usize,
    pub auto_fixable: usize,
    pub manual_review: usize,
    pub skip_recommended: usize,
    pub total_risk_score: u32,
    pub average_risk_score: f64,
    /// `(issue_index, risk_score)` pairs for issues scoring 50 or higher
    pub high_risk_issues: Vec<(usize, u8)>,
}

/// Selects default strategies and computes risk scores
pub struct RecommendationEngine<'a> {
    conn: &'a dyn Connection,
    graph: &'a RelationshipGraph,
    metadata: &'a MetadataCache,
}

impl<'a> RecommendationEngine<'a> {
    pub fn new(
        conn: &'a dyn Connection,
        graph: &'a RelationshipGraph,
        metadata: &'a MetadataCache,
    ) -> Self {
        Self {
            conn,
            graph,
            metadata,
        }
    }

    /// Select a recommended option for every step that has options
    pub async fn recommend_all(
        &self,
        issues: &[CompatibilityIssue],
        steps: &mut [PlannedStep],
    ) -> Result<()> {
        for step in steps.iter_mut() {
            if step.options.is_empty() {
                continue;
            }
            let Some(issue) = issues.get(step.issue_index) else {
                continue;
            };
            step.selected_option = self.recommend(issue, &step.options).await?;
        }
        debug!(steps = steps.len(), "applied recommendations");
        Ok(())
    }

    /// Pick the default option for one issue.
    ///
    /// Pre-flagged recommendations win; then the dynamic branches for dates
    /// and charsets; then the static rule table; then the first non-skip
    /// option; then the first option.
    pub async fn recommend(
        &self,
        issue: &CompatibilityIssue,
        options: &[FixOption],
    ) -> Result<Option<FixOption>> {
        if options.is_empty() {
            return Ok(None);
        }

        if let Some(flagged) = options.iter().find(|o| o.is_recommended) {
            return Ok(Some(flagged.clone()));
        }

        match issue.kind {
            IssueKind::InvalidDate => {
                if let Some(option) = self.recommend_invalid_date(issue, options).await? {
                    return Ok(Some(option));
                }
            }
            IssueKind::Charset => {
                for strategy in [
                    FixStrategy::CharsetFkSafe,
                    FixStrategy::CharsetFkCascade,
                    FixStrategy::CharsetSingle,
                ] {
                    if let Some(option) = options.iter().find(|o| o.strategy == strategy) {
                        return Ok(Some(option.clone()));
                    }
                }
            }
            _ => {
                let rule = rule_for(issue.kind);
                if let Some(option) = options.iter().find(|o| o.strategy == rule.strategy) {
                    return Ok(Some(option.clone()));
                }
            }
        }

        if let Some(option) = options.iter().find(|o| !o.strategy.is_skip()) {
            return Ok(Some(option.clone()));
        }
        Ok(options.first().cloned())
    }

    async fn recommend_invalid_date(
        &self,
        issue: &CompatibilityIssue,
        options: &[FixOption],
    ) -> Result<Option<FixOption>> {
        let (Some(table), Some(column)) = (issue.table_name.as_deref(), issue.column_name.as_deref())
        else {
            return Ok(None);
        };

        let nullable = self.metadata.is_nullable(self.conn, table, column).await?;
        let preferred = if nullable {
            FixStrategy::DateToNull
        } else {
            FixStrategy::DateToMin
        };
        Ok(options.iter().find(|o| o.strategy == preferred).cloned())
    }

    /// Risk score in [0, 100]. Pure for a fixed graph: identical input
    /// yields an identical score.
    pub fn risk_score(&self, issue: &CompatibilityIssue) -> u8 {
        let mut score = u32::from(rule_for(issue.kind).base_risk);

        if issue.kind.is_data_lossy() {
            score += 10;
        }

        if issue.kind == IssueKind::Charset {
            let table = issue
                .table_name
                .as_deref()
                .or_else(|| issue.location.split('.').nth(1));
            if let Some(table) = table {
                if self.graph.related_tables(table).len() > 3 {
                    score += 15;
                }
            }
        }

        if matches!(issue.kind, IssueKind::DeprecatedEngine | IssueKind::Partition) {
            score += 10;
        }
        if matches!(issue.kind, IssueKind::AuthPlugin | IssueKind::SuperPrivilege) {
            score += 5;
        }

        score.min(100) as u8
    }

    /// Advisory execution order: step indices of executable steps, cheapest
    /// strategy first. Distinct from the topological FK order the executor
    /// applies for correctness.
    pub fn execution_order(&self, steps: &[PlannedStep]) -> Vec<usize> {
        let mut weighted: Vec<(usize, u8)> = steps
            .iter()
            .enumerate()
            .filter_map(|(index, step)| {
                let option = step.selected_option.as_ref()?;
                if option.strategy.is_skip() || option.strategy.is_manual() {
                    return None;
                }
                let weight = match option.strategy {
                    FixStrategy::CharsetFkSafe => 30,
                    FixStrategy::CharsetFkCascade => 40,
                    FixStrategy::DateToNull | FixStrategy::DateToMin => 20,
                    _ => 10,
                };
                Some((index, weight))
            })
            .collect();
        weighted.sort_by_key(|(_, weight)| *weight);
        weighted.into_iter().map(|(index, _)| index).collect()
    }

    /// Summarize a recommendation pass over the planned steps
    pub fn summary(
        &self,
        issues: &[CompatibilityIssue],
        steps: &[PlannedStep],
    ) -> RecommendationSummary {
        let mut summary = RecommendationSummary {
            total_issues: steps.len(),
            ..Default::default()
        };

        for step in steps {
            match step.selected_option.as_ref().map(|o| o.strategy) {
                None | Some(FixStrategy::Manual) => summary.manual_review += 1,
                Some(FixStrategy::Skip) => summary.skip_recommended += 1,
                Some(_) => summary.auto_fixable += 1,
            }

            if let Some(issue) = issues.get(step.issue_index) {
                let risk = self.risk_score(issue);
                summary.total_risk_score += u32::from(risk);
                if risk >= 50 {
                    summary.high_risk_issues.push((step.issue_index, risk));
                }
            }
        }

        if !steps.is_empty() {
            summary.average_risk_score = f64::from(summary.total_risk_score) / steps.len() as f64;
        }
        summary
    }
}
