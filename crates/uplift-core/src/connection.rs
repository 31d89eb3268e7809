//! Database session boundary

use async_trait::async_trait;

use crate::{QueryResult, Result, StatementResult};

/// A live database session the migration engine operates through.
///
/// The engine never opens connections itself. Callers hand it an object
/// implementing this trait and the engine issues every metadata read, DDL
/// statement, and transaction control call through it. All session state the
/// engine mutates (`FOREIGN_KEY_CHECKS`, `sql_mode`) goes through `execute`
/// so a mock can observe it.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Execute a statement that does not return rows (DDL, UPDATE, SET)
    async fn execute(&self, sql: &str) -> Result<StatementResult>;

    /// Execute a query that returns rows
    async fn query(&self, sql: &str) -> Result<QueryResult>;

    /// Commit the current transaction
    async fn commit(&self) -> Result<()>;

    /// Roll back the current transaction
    async fn rollback(&self) -> Result<()>;

    /// Server version string, e.g. "8.0.36"
    async fn server_version(&self) -> Result<String>;

    /// Short name of the underlying driver, for log context
    fn driver_name(&self) -> &str;
}
