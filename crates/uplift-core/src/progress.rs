//! Progress reporting and cooperative cancellation

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Receives progress events from long-running engine operations.
///
/// Implementations must be cheap: the executor calls these between
/// statements on its own task. The default implementations do nothing, so a
/// caller can override only the events it cares about.
pub trait ProgressSink: Send + Sync {
    /// A named phase started (e.g. "drop_foreign_keys", "convert", "restore")
    fn on_phase(&self, _phase: &str) {}

    /// A step began executing. `index` is zero-based, `total` is the batch size.
    fn on_step_started(&self, _index: usize, _total: usize, _description: &str) {}

    /// A step finished, successfully or not
    fn on_step_finished(&self, _index: usize, _total: usize, _success: bool) {}

    /// Free-form status line, for UIs that show a ticker
    fn on_message(&self, _message: &str) {}
}

/// A sink that drops all events
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgress;

impl ProgressSink for NullProgress {}

/// Cooperative cancellation flag.
///
/// The executor checks this between statements, never mid-statement; a
/// cancelled batch stops at the next statement boundary and rolls back like
/// any other failure.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    inner: Arc<AtomicBool>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.inner.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.load(Ordering::Relaxed)
    }
}
