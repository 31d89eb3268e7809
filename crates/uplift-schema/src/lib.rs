//! Uplift Schema - Foreign-key topology and table metadata
//!
//! Everything the migration engine knows about a schema's shape lives here:
//!
//! - `ForeignKeyDefinition` - One FK constraint with its drop/re-add DDL
//! - `RelationshipGraph` - FK adjacency with BFS reachability, topological
//!   ordering, and cascade-skip analysis
//! - `MetadataCache` - Session-scoped cache of column and charset metadata

mod foreign_key;
mod graph;
mod metadata;

pub use foreign_key::*;
pub use graph::*;
pub use metadata::*;
