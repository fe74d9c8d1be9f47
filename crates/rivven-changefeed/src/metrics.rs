//! Reconciler metrics
//!
//! Recorded through the `metrics` facade; nothing is exported unless the
//! embedding process installs a recorder.

use std::fmt;
use std::time::Duration;

/// Reconciler operation, used as the `operation` label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Create a job
    Create,
    /// Refresh a record
    Read,
    /// Adopt an existing job
    Import,
    /// Change the table set
    Update,
    /// Converge a record to a desired spec
    Apply,
    /// Cancel a job
    Delete,
    /// Running check
    Exists,
}

impl Operation {
    /// Label value
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Read => "read",
            Self::Import => "import",
            Self::Update => "update",
            Self::Apply => "apply",
            Self::Delete => "delete",
            Self::Exists => "exists",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metrics for the changefeed reconciler
#[derive(Clone)]
pub struct ReconcilerMetrics {
    /// Counter for control statements sent
    pub statements: metrics::Counter,
    /// Histogram for time spent waiting on job status
    pub status_wait: metrics::Histogram,
}

impl ReconcilerMetrics {
    /// Create new reconciler metrics
    pub fn new() -> Self {
        Self {
            statements: metrics::counter!("rivven_changefeed_statements_total"),
            status_wait: metrics::histogram!("rivven_changefeed_status_wait_seconds"),
        }
    }

    /// Count one started operation
    pub fn operation(&self, operation: Operation) {
        metrics::counter!("rivven_changefeed_operations_total", "operation" => operation.as_str())
            .increment(1);
    }

    /// Count one failed operation
    pub fn operation_error(&self, operation: Operation) {
        metrics::counter!(
            "rivven_changefeed_operation_errors_total",
            "operation" => operation.as_str()
        )
        .increment(1);
    }

    /// Count one control statement
    pub fn statement(&self) {
        self.statements.increment(1);
    }

    /// Record a completed status wait
    pub fn record_wait(&self, elapsed: Duration) {
        self.status_wait.record(elapsed.as_secs_f64());
    }
}

impl Default for ReconcilerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ReconcilerMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconcilerMetrics").finish_non_exhaustive()
    }
}
