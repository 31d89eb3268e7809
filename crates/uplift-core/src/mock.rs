//! Scripted in-memory `Connection` for tests.
//!
//! Queries are answered by substring match against registered scripts, in
//! registration order. Statements succeed and are logged unless a failure
//! trigger matches, which lets tests force a failure at an exact point in a
//! batch.

use parking_lot::Mutex;

use async_trait::async_trait;

use crate::{Connection, QueryResult, Result, StatementResult, UpliftError, Value};

struct Script {
    needle: String,
    result: QueryResult,
}

struct FailureTrigger {
    needle: String,
    message: String,
    /// Remaining matches before the trigger fires; 0 fires immediately
    skip: usize,
}

#[derive(Default)]
struct MockState {
    scripts: Vec<Script>,
    triggers: Vec<FailureTrigger>,
    executed: Vec<String>,
    queried: Vec<String>,
    commits: usize,
    rollbacks: usize,
}

/// In-memory connection with scripted responses
#[derive(Default)]
pub struct MockConnection {
    state: Mutex<MockState>,
    version: String,
}

impl MockConnection {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            version: "8.0.36".to_string(),
        }
    }

    pub fn with_version(version: &str) -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            version: version.to_string(),
        }
    }

    /// Answer any query containing `needle` with `result`.
    ///
    /// Scripts are checked in registration order; the first match wins, so
    /// register more specific needles first.
    pub fn script_query(&self, needle: &str, result: QueryResult) {
        self.state.lock().scripts.push(Script {
            needle: needle.to_string(),
            result,
        });
    }

    /// Convenience for scripting a single-column, single-row result
    pub fn script_scalar(&self, needle: &str, column: &str, value: Value) {
        self.script_query(needle, QueryResult::new(vec![column], vec![vec![value]]));
    }

    /// Make the next statement containing `needle` fail with a query error
    pub fn fail_on_execute(&self, needle: &str, message: &str) {
        self.fail_on_execute_nth(needle, message, 0);
    }

    /// Like `fail_on_execute` but skips the first `skip` matching statements
    pub fn fail_on_execute_nth(&self, needle: &str, message: &str, skip: usize) {
        self.state.lock().triggers.push(FailureTrigger {
            needle: needle.to_string(),
            message: message.to_string(),
            skip,
        });
    }

    /// All statements passed to `execute`, in order
    pub fn executed_sql(&self) -> Vec<String> {
        self.state.lock().executed.clone()
    }

    /// All queries passed to `query`, in order
    pub fn queried_sql(&self) -> Vec<String> {
        self.state.lock().queried.clone()
    }

    pub fn commit_count(&self) -> usize {
        self.state.lock().commits
    }

    pub fn rollback_count(&self) -> usize {
        self.state.lock().rollbacks
    }
}

impl std::fmt::Debug for MockConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MockConnection")
            .field("executed", &state.executed.len())
            .field("queried", &state.queried.len())
            .finish()
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn execute(&self, sql: &str) -> Result<StatementResult> {
        let mut state = self.state.lock();
        let mut fired: Option<String> = None;
        for trigger in &mut state.triggers {
            if sql.contains(&trigger.needle) {
                if trigger.skip == 0 {
                    fired = Some(trigger.message.clone());
                    break;
                }
                trigger.skip -= 1;
            }
        }
        if let Some(message) = fired {
            return Err(UpliftError::Query(message));
        }
        state.executed.push(sql.to_string());
        Ok(StatementResult { affected_rows: 1 })
    }

    async fn query(&self, sql: &str) -> Result<QueryResult> {
        let mut state = self.state.lock();
        state.queried.push(sql.to_string());
        for script in &state.scripts {
            if sql.contains(&script.needle) {
                return Ok(script.result.clone());
            }
        }
        Ok(QueryResult::default())
    }

    async fn commit(&self) -> Result<()> {
        self.state.lock().commits += 1;
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.state.lock().rollbacks += 1;
        Ok(())
    }

    async fn server_version(&self) -> Result<String> {
        Ok(self.version.clone())
    }

    fn driver_name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn scripted_query_matches_by_substring() {
        let conn = MockConnection::new();
        conn.script_scalar("TABLE_COLLATION", "TABLE_COLLATION", Value::from("utf8mb3_general_ci"));

        let result = conn
            .query("SELECT TABLE_COLLATION FROM information_schema.TABLES")
            .await
            .unwrap();
        assert_eq!(
            result.first().and_then(|r| r.get_str("TABLE_COLLATION")),
            Some("utf8mb3_general_ci")
        );
    }

    #[tokio::test]
    async fn unscripted_query_returns_empty() {
        let conn = MockConnection::new();
        let result = conn.query("SELECT 1").await.unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn failure_trigger_fires_on_nth_match() {
        let conn = MockConnection::new();
        conn.fail_on_execute_nth("ALTER TABLE", "boom", 1);

        assert!(conn.execute("ALTER TABLE `a` ENGINE=InnoDB").await.is_ok());
        let err = conn.execute("ALTER TABLE `b` ENGINE=InnoDB").await.unwrap_err();
        assert!(matches!(err, UpliftError::Query(_)));
        assert_eq!(conn.executed_sql().len(), 1);
    }
}
