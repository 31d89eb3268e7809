//! Core value and result types

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A database value read back from a metadata or data query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// NULL value
    Null,
    /// Boolean
    Bool(bool),
    /// 64-bit signed integer
    Int64(i64),
    /// 64-bit unsigned integer
    UInt64(u64),
    /// 64-bit floating point
    Float64(f64),
    /// UTF-8 string
    String(String),
}

impl Value {
    /// Check if the value is NULL
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Try to get as a string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get as i64
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(v) => Some(*v),
            Value::UInt64(v) => i64::try_from(*v).ok(),
            Value::String(s) => s.parse::<i64>().ok(),
            _ => None,
        }
    }

    /// Try to get as f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float64(v) => Some(*v),
            Value::Int64(v) => Some(*v as f64),
            Value::UInt64(v) => Some(*v as f64),
            Value::String(s) => s.parse::<f64>().ok(),
            _ => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Int64(v) => write!(f, "{}", v),
            Value::UInt64(v) => write!(f, "{}", v),
            Value::Float64(v) => write!(f, "{}", v),
            Value::String(v) => write!(f, "{}", v),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<Option<&str>> for Value {
    fn from(v: Option<&str>) -> Self {
        match v {
            Some(s) => Value::String(s.to_string()),
            None => Value::Null,
        }
    }
}

/// A row from a query result
#[derive(Debug, Clone)]
pub struct Row {
    /// Column values, positionally aligned with the column names
    pub values: Vec<Value>,
    /// Column names (shared across all rows of a result)
    columns: Arc<Vec<String>>,
}

impl Row {
    /// Create a row over a shared column-name list
    pub fn new(columns: Arc<Vec<String>>, values: Vec<Value>) -> Self {
        Self { values, columns }
    }

    /// Get a value by column name
    pub fn get(&self, column: &str) -> Option<&Value> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.values.get(idx)
    }

    /// Get a value by column name as a string, treating NULL as `None`
    pub fn get_str(&self, column: &str) -> Option<&str> {
        self.get(column).and_then(Value::as_str)
    }

    /// Get a value by column name as i64, treating NULL as `None`
    pub fn get_i64(&self, column: &str) -> Option<i64> {
        self.get(column).and_then(Value::as_i64)
    }
}

/// Result of a query that returns rows
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    /// Column names
    pub columns: Arc<Vec<String>>,
    /// Result rows
    pub rows: Vec<Row>,
}

impl QueryResult {
    /// Build a result from column names and positional value rows
    pub fn new(columns: Vec<&str>, rows: Vec<Vec<Value>>) -> Self {
        let columns = Arc::new(columns.into_iter().map(String::from).collect::<Vec<_>>());
        let rows = rows
            .into_iter()
            .map(|values| Row::new(Arc::clone(&columns), values))
            .collect();
        Self { columns, rows }
    }

    /// True when the result has no rows
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// First row, if any
    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }
}

/// Result of a statement that modifies data or schema
#[derive(Debug, Clone, Copy, Default)]
pub struct StatementResult {
    /// Number of rows the statement affected (0 for DDL)
    pub affected_rows: u64,
}
