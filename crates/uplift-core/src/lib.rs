//! Uplift Core - Foundation types for the FK-aware migration engine
//!
//! This crate defines the contracts every other Uplift crate builds on:
//!
//! - `Connection` - Trait for the database session boundary
//! - `CompatibilityIssue` / `IssueKind` - The record format produced by the
//!   external detection rules and consumed by the engine
//! - `Value`, `Row`, `QueryResult` - Result shapes for metadata queries
//! - `ProgressSink` / `CancelFlag` - Observational progress and cooperative
//!   cancellation

mod connection;
mod error;
mod issue;
mod progress;
mod types;

#[cfg(any(test, feature = "test-support"))]
pub mod mock;

pub use connection::*;
pub use error::*;
pub use issue::*;
pub use progress::*;
pub use types::*;
