//! Error types for Uplift

use thiserror::Error;

/// Core error type for Uplift operations
#[derive(Error, Debug)]
pub enum UpliftError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Permission error: {0}")]
    Permission(String),

    #[error("State error: {0}")]
    State(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl UpliftError {
    /// True when the error carries the server's "not a BASE TABLE" signature
    /// (MySQL error 1347), raised when DDL targets a view. The engine treats
    /// this as a skippable condition, not a batch failure.
    pub fn is_not_base_table(&self) -> bool {
        match self {
            UpliftError::Query(msg) => {
                msg.contains("is not BASE TABLE") || msg.contains("1347")
            }
            _ => false,
        }
    }
}

/// Result type alias for Uplift operations
pub type Result<T> = std::result::Result<T, UpliftError>;
