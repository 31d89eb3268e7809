//! Pre-migration environment checks
//!
//! Independent checks aggregated into one report. A `Critical` failure
//! blocks progression; warnings are surfaced but do not.

use tracing::debug;

use uplift_core::{Connection, IssueSeverity, Result};

/// Privileges the engine needs for every fix strategy it can emit
const REQUIRED_PRIVILEGES: [&str; 5] = ["ALTER", "UPDATE", "DELETE", "SELECT", "INSERT"];

/// Tables above this row estimate dominate conversion time
const LARGE_TABLE_THRESHOLD: i64 = 100_000;

/// One preflight check outcome
#[derive(Debug, Clone)]
pub struct PreflightCheck {
    pub name: String,
    pub passed: bool,
    pub severity: IssueSeverity,
    pub message: String,
}

impl PreflightCheck {
    fn pass(name: &str, message: String) -> Self {
        Self {
            name: name.to_string(),
            passed: true,
            severity: IssueSeverity::Info,
            message,
        }
    }

    fn warn(name: &str, message: String) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            severity: IssueSeverity::Warning,
            message,
        }
    }

    fn block(name: &str, message: String) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            severity: IssueSeverity::Critical,
            message,
        }
    }
}

/// Aggregated preflight outcome
#[derive(Debug, Clone)]
pub struct PreflightReport {
    pub checks: Vec<PreflightCheck>,
    pub schema_size_mb: f64,
    pub large_tables: Vec<String>,
    pub estimated_seconds: u64,
}

impl PreflightReport {
    /// Only critical failures block the run
    pub fn can_proceed(&self) -> bool {
        self.checks
            .iter()
            .all(|check| check.passed || check.severity != IssueSeverity::Critical)
    }

    pub fn warnings(&self) -> Vec<&PreflightCheck> {
        self.checks
            .iter()
            .filter(|check| !check.passed && check.severity == IssueSeverity::Warning)
            .collect()
    }
}

/// Runs the preflight checks for one schema
pub struct PreflightChecker<'a> {
    conn: &'a dyn Connection,
    schema: String,
}

impl<'a> PreflightChecker<'a> {
    pub fn new(conn: &'a dyn Connection, schema: &str) -> Self {
        Self {
            conn,
            schema: schema.to_string(),
        }
    }

    pub async fn run(&self, issue_count: usize, backup_confirmed: bool) -> Result<PreflightReport> {
        let mut checks = Vec::new();

        checks.push(self.check_version().await);
        checks.push(self.check_privileges().await);
        checks.push(self.check_concurrent_sessions().await);
        checks.push(backup_check(backup_confirmed));

        let schema_size_mb = self.schema_size_mb().await.unwrap_or(0.0);
        checks.push(PreflightCheck::pass(
            "schema size",
            format!(
                "schema is {schema_size_mb:.1} MB; conversion needs roughly the same amount of free space again"
            ),
        ));

        let large_tables = self.large_tables().await.unwrap_or_default();
        let estimated_seconds = estimate_duration_seconds(issue_count, large_tables.len());

        debug!(
            checks = checks.len(),
            schema_size_mb,
            large_tables = large_tables.len(),
            estimated_seconds,
            "preflight finished"
        );
        Ok(PreflightReport {
            checks,
            schema_size_mb,
            large_tables,
            estimated_seconds,
        })
    }

    async fn check_version(&self) -> PreflightCheck {
        match self.conn.server_version().await {
            Ok(version) if version.starts_with("8.0") => {
                PreflightCheck::pass("server version", format!("source server is {version}"))
            }
            Ok(version) => PreflightCheck::warn(
                "server version",
                format!("expected a MySQL 8.0 source, found {version}"),
            ),
            Err(err) => PreflightCheck::block(
                "server version",
                format!("could not read the server version: {err}"),
            ),
        }
    }

    async fn check_privileges(&self) -> PreflightCheck {
        let grants = match self.conn.query("SHOW GRANTS").await {
            Ok(result) => result,
            Err(err) => {
                return PreflightCheck::block(
                    "privileges",
                    format!("could not read grants: {err}"),
                );
            }
        };

        let mut granted: Vec<String> = Vec::new();
        for row in &grants.rows {
            let Some(grant) = row.values.first().and_then(|v| v.as_str()) else {
                continue;
            };
            granted.extend(parse_grant_line(grant, &self.schema));
        }

        let missing: Vec<&str> = REQUIRED_PRIVILEGES
            .iter()
            .filter(|p| !granted.iter().any(|g| g == *p || g == "ALL PRIVILEGES"))
            .copied()
            .collect();

        if missing.is_empty() {
            PreflightCheck::pass("privileges", "all required privileges granted".to_string())
        } else {
            PreflightCheck::block(
                "privileges",
                format!("missing privileges on `{}`: {}", self.schema, missing.join(", ")),
            )
        }
    }

    async fn check_concurrent_sessions(&self) -> PreflightCheck {
        let result = match self.conn.query("SHOW PROCESSLIST").await {
            Ok(result) => result,
            Err(err) => {
                return PreflightCheck::warn(
                    "concurrent sessions",
                    format!("could not read the process list: {err}"),
                );
            }
        };

        let active = result
            .rows
            .iter()
            .filter(|row| row.get_str("Command").is_some_and(|c| c != "Sleep"))
            .count();

        // Our own session is always in the list
        if active <= 1 {
            PreflightCheck::pass(
                "concurrent sessions",
                "no other active sessions".to_string(),
            )
        } else {
            PreflightCheck::warn(
                "concurrent sessions",
                format!("{} other active sessions; DDL may block on their locks", active - 1),
            )
        }
    }

    async fn schema_size_mb(&self) -> Result<f64> {
        let sql = format!(
            "SELECT ROUND(SUM(DATA_LENGTH + INDEX_LENGTH) / 1024 / 1024, 1) AS size_mb \
             FROM INFORMATION_SCHEMA.TABLES \
             WHERE TABLE_SCHEMA = '{}'",
            self.schema
        );
        let result = self.conn.query(&sql).await?;
        Ok(result
            .first()
            .and_then(|row| row.get("size_mb"))
            .and_then(uplift_core::Value::as_f64)
            .unwrap_or(0.0))
    }

    async fn large_tables(&self) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT TABLE_NAME, TABLE_ROWS \
             FROM INFORMATION_SCHEMA.TABLES \
             WHERE TABLE_SCHEMA = '{}' AND TABLE_TYPE = 'BASE TABLE' \
               AND TABLE_ROWS > {LARGE_TABLE_THRESHOLD} \
             ORDER BY TABLE_ROWS DESC",
            self.schema
        );
        let result = self.conn.query(&sql).await?;
        Ok(result
            .rows
            .iter()
            .filter_map(|row| row.get_str("TABLE_NAME").map(String::from))
            .collect())
    }
}

fn backup_check(backup_confirmed: bool) -> PreflightCheck {
    if backup_confirmed {
        PreflightCheck::pass("backup", "backup confirmed by the operator".to_string())
    } else {
        PreflightCheck::block(
            "backup",
            "no backup confirmation; date rewrites and charset conversions are not reversible without one".to_string(),
        )
    }
}

/// Privileges a single `SHOW GRANTS` line confers on `schema`
fn parse_grant_line(grant: &str, schema: &str) -> Vec<String> {
    let upper = grant.to_uppercase();
    let Some(on_idx) = upper.find(" ON ") else {
        return Vec::new();
    };

    let scope = &grant[on_idx + 4..];
    let global = scope.trim_start().starts_with("*.*");
    let schema_scoped =
        scope.contains(&format!("`{schema}`")) || scope.trim_start().starts_with(&format!("{schema}."));
    if !global && !schema_scoped {
        return Vec::new();
    }

    let list = upper
        .trim_start()
        .trim_start_matches("GRANT ")
        .split(" ON ")
        .next()
        .unwrap_or("");
    if list.contains("ALL PRIVILEGES") {
        return vec!["ALL PRIVILEGES".to_string()];
    }
    list.split(',').map(|p| p.trim().to_string()).collect()
}

/// Coarse wall-clock estimate: a handful of seconds per issue plus a
/// penalty per large table, floored at 30 seconds
fn estimate_duration_seconds(issue_count: usize, large_table_count: usize) -> u64 {
    (issue_count as u64 * 5 + large_table_count as u64 * 30).max(30)
}
