//! Uplift Migrate - FK-aware migration planning and execution
//!
//! The engine takes a list of externally detected compatibility issues and
//! carries them through a linear workflow:
//!
//! preflight -> analysis -> recommendation -> execution -> validation
//!
//! - `options` - Fix strategies and per-issue option generation
//! - `safe_change` - Three-phase FK-safe charset conversion
//! - `recommend` - Default strategy selection and risk scoring
//! - `executor` - Batch execution with dry-run and rollback capture
//! - `rollback` - Consolidated rollback script generation
//! - `plan` - Charset fix planning over the FK closure
//! - `state` - Persisted, resumable migration state
//! - `preflight` / `validate` - Bookend checks around execution

mod executor;
mod options;
mod plan;
mod preflight;
mod recommend;
mod rollback;
mod safe_change;
mod state;
mod validate;

pub use executor::*;
pub use options::*;
pub use plan::*;
pub use preflight::*;
pub use recommend::*;
pub use rollback::*;
pub use safe_change::*;
pub use state::*;
pub use validate::*;

/// Charset every fix converts to
pub const TARGET_CHARSET: &str = "utf8mb4";
/// Collation every fix converts to
pub const TARGET_COLLATION: &str = "utf8mb4_unicode_ci";
