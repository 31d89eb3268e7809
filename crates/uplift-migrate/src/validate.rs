//! Post-migration validation
//!
//! The detection rules live outside the engine behind `IssueDetector`;
//! validation re-runs them and diffs the issue sets by key.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexSet;
use serde::Serialize;
use tracing::debug;

use uplift_core::{CompatibilityIssue, Connection, Result};

/// The external rule-engine boundary. The engine consumes issues, it never
/// derives them itself.
#[async_trait]
pub trait IssueDetector: Send + Sync {
    async fn detect(
        &self,
        conn: &dyn Connection,
        schema: &str,
    ) -> Result<Vec<CompatibilityIssue>>;
}

/// Pre/post diff of the detected issue sets
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub fixed: Vec<CompatibilityIssue>,
    pub remaining: Vec<CompatibilityIssue>,
    pub newly_introduced: Vec<CompatibilityIssue>,
    pub all_fixed: bool,
}

/// Serializable run summary for export
#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub schema: String,
    pub generated_at: DateTime<Utc>,
    pub total_issues: usize,
    pub fixed_count: usize,
    pub remaining_count: usize,
    pub new_count: usize,
    pub all_fixed: bool,
    pub fixed: Vec<CompatibilityIssue>,
    pub remaining: Vec<CompatibilityIssue>,
    pub newly_introduced: Vec<CompatibilityIssue>,
}

impl MigrationReport {
    pub fn from_validation(schema: &str, total_issues: usize, report: &ValidationReport) -> Self {
        Self {
            schema: schema.to_string(),
            generated_at: Utc::now(),
            total_issues,
            fixed_count: report.fixed.len(),
            remaining_count: report.remaining.len(),
            new_count: report.newly_introduced.len(),
            all_fixed: report.all_fixed,
            fixed: report.fixed.clone(),
            remaining: report.remaining.clone(),
            newly_introduced: report.newly_introduced.clone(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Re-runs detection after execution and classifies every issue
pub struct PostValidator<'a> {
    conn: &'a dyn Connection,
    schema: String,
}

impl<'a> PostValidator<'a> {
    pub fn new(conn: &'a dyn Connection, schema: &str) -> Self {
        Self {
            conn,
            schema: schema.to_string(),
        }
    }

    pub async fn validate(
        &self,
        pre_issues: &[CompatibilityIssue],
        detector: &dyn IssueDetector,
    ) -> Result<ValidationReport> {
        let post_issues = detector.detect(self.conn, &self.schema).await?;

        let pre_keys: IndexSet<String> = pre_issues.iter().map(|i| i.issue_key()).collect();
        let post_keys: IndexSet<String> = post_issues.iter().map(|i| i.issue_key()).collect();

        let fixed: Vec<CompatibilityIssue> = pre_issues
            .iter()
            .filter(|i| !post_keys.contains(&i.issue_key()))
            .cloned()
            .collect();
        let remaining: Vec<CompatibilityIssue> = pre_issues
            .iter()
            .filter(|i| post_keys.contains(&i.issue_key()))
            .cloned()
            .collect();
        let newly_introduced: Vec<CompatibilityIssue> = post_issues
            .iter()
            .filter(|i| !pre_keys.contains(&i.issue_key()))
            .cloned()
            .collect();

        let all_fixed = remaining.is_empty() && newly_introduced.is_empty();
        debug!(
            fixed = fixed.len(),
            remaining = remaining.len(),
            new = newly_introduced.len(),
            all_fixed,
            "post-migration validation"
        );
        Ok(ValidationReport {
            fixed,
            remaining,
            newly_introduced,
            all_fixed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use uplift_core::{IssueKind, IssueSeverity, mock::MockConnection};

    struct FixedDetector {
        issues: Vec<CompatibilityIssue>,
    }

    #[async_trait]
    impl IssueDetector for FixedDetector {
        async fn detect(
            &self,
            _conn: &dyn Connection,
            _schema: &str,
        ) -> Result<Vec<CompatibilityIssue>> {
            Ok(self.issues.clone())
        }
    }

    fn issue(kind: IssueKind, location: &str) -> CompatibilityIssue {
        let parts: Vec<&str> = location.split('.').collect();
        CompatibilityIssue {
            kind,
            severity: IssueSeverity::Warning,
            location: location.to_string(),
            description: "detected".to_string(),
            table_name: parts.get(1).map(|s| s.to_string()),
            column_name: parts.get(2).map(|s| s.to_string()),
        }
    }

    #[tokio::test]
    async fn resolved_issues_are_classified_as_fixed() {
        let conn = MockConnection::new();
        let pre = vec![
            issue(IssueKind::Charset, "shop.orders"),
            issue(IssueKind::InvalidDate, "shop.orders.created_at"),
        ];
        let detector = FixedDetector {
            issues: vec![issue(IssueKind::InvalidDate, "shop.orders.created_at")],
        };

        let report = PostValidator::new(&conn, "shop")
            .validate(&pre, &detector)
            .await
            .unwrap();

        assert_eq!(report.fixed.len(), 1);
        assert_eq!(report.fixed[0].location, "shop.orders");
        assert_eq!(report.remaining.len(), 1);
        assert!(report.newly_introduced.is_empty());
        assert!(!report.all_fixed);
    }

    #[tokio::test]
    async fn clean_post_run_reports_all_fixed() {
        let conn = MockConnection::new();
        let pre = vec![issue(IssueKind::Charset, "shop.orders")];
        let detector = FixedDetector { issues: vec![] };

        let report = PostValidator::new(&conn, "shop")
            .validate(&pre, &detector)
            .await
            .unwrap();

        assert!(report.all_fixed);
        assert_eq!(report.fixed.len(), 1);
    }

    #[tokio::test]
    async fn unexpected_issues_count_as_newly_introduced() {
        let conn = MockConnection::new();
        let pre = vec![issue(IssueKind::Charset, "shop.orders")];
        let detector = FixedDetector {
            issues: vec![issue(IssueKind::FkNameLength, "shop.orders")],
        };

        let report = PostValidator::new(&conn, "shop")
            .validate(&pre, &detector)
            .await
            .unwrap();

        assert_eq!(report.newly_introduced.len(), 1);
        assert!(!report.all_fixed);
    }

    #[tokio::test]
    async fn migration_report_exports_to_json() {
        let conn = MockConnection::new();
        let pre = vec![issue(IssueKind::Charset, "shop.orders")];
        let detector = FixedDetector { issues: vec![] };

        let validation = PostValidator::new(&conn, "shop")
            .validate(&pre, &detector)
            .await
            .unwrap();
        let report = MigrationReport::from_validation("shop", 1, &validation);
        let json = report.to_json().unwrap();

        assert!(json.contains("\"schema\": \"shop\""));
        assert!(json.contains("\"all_fixed\": true"));
        assert!(json.contains("\"kind\": \"charset\""));
    }
}
