//! Error types for rivven-changefeed
//!
//! Errors are classified so callers can tell "still transitioning, try
//! later" (timeouts, transient connection failures) apart from problems that
//! need a human (rejected statements, invalid input, a stalled update).

use std::time::Duration;
use thiserror::Error;

use crate::record::UpdatePhase;

/// Result type for changefeed operations
pub type Result<T> = std::result::Result<T, ChangefeedError>;

/// Boxed source error from a database driver
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Connection-related errors (retriable)
    Connection,
    /// Statement rejected by the database
    Query,
    /// Transaction begin/commit/rollback errors (retriable)
    Transaction,
    /// Job or row not found
    NotFound,
    /// Timed out waiting for a job status (retriable)
    Timeout,
    /// Malformed input, rejected before any remote call
    Validation,
    /// Update saga stopped part-way
    Saga,
    /// Serialization or local I/O errors
    Other,
}

impl ErrorCategory {
    /// Whether errors in this category are generally retriable
    #[inline]
    pub const fn is_retriable(self) -> bool {
        matches!(self, Self::Connection | Self::Transaction | Self::Timeout)
    }
}

/// Main error type for changefeed reconciliation
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum ChangefeedError {
    /// Could not reach the database
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Could not begin a scoped transaction
    #[error("error starting transaction: {message}")]
    TransactionStart {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Commit or rollback failed
    #[error("transaction error: {message}")]
    Transaction {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Raw statement failure reported by the driver
    #[error("query error: {message}")]
    Query {
        message: String,
        sql: Option<String>,
        #[source]
        source: Option<BoxError>,
    },

    /// A control statement failed; `intent` says what the reconciler was doing
    #[error("{intent}: {source}")]
    Statement {
        intent: String,
        #[source]
        source: Box<ChangefeedError>,
    },

    /// A status or existence query returned no row
    #[error("changefeed job not found: {0}")]
    NotFound(String),

    /// The job did not reach the requested status in time
    #[error("timeout reached after {elapsed:?} while waiting for job {job_id} status to be {target} (last observed: {})", last_observed.as_deref().unwrap_or("none"))]
    Timeout {
        job_id: String,
        target: String,
        last_observed: Option<String>,
        elapsed: Duration,
    },

    /// Invalid input
    #[error("validation error: {0}")]
    Validation(String),

    /// A field that is fixed after creation was changed
    #[error("field '{field}' cannot be changed in place (current: '{current}', desired: '{desired}')")]
    ImmutableField {
        field: &'static str,
        current: String,
        desired: String,
    },

    /// The alter phase of an update failed and was rolled back
    #[error("update of job {job_id} aborted during {phase} phase ({}): {source}", if *resumed { "job resumed" } else { "job left paused, manual intervention required" })]
    UpdateAborted {
        job_id: String,
        phase: UpdatePhase,
        resumed: bool,
        #[source]
        source: Box<ChangefeedError>,
    },

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChangefeedError {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Connection { .. } => ErrorCategory::Connection,
            Self::TransactionStart { .. } | Self::Transaction { .. } => ErrorCategory::Transaction,
            Self::Query { .. } => ErrorCategory::Query,
            Self::Statement { source, .. } => source.category(),
            Self::NotFound(_) => ErrorCategory::NotFound,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Validation(_) | Self::ImmutableField { .. } => ErrorCategory::Validation,
            Self::UpdateAborted { .. } => ErrorCategory::Saga,
            Self::Json(_) | Self::Yaml(_) | Self::Io(_) => ErrorCategory::Other,
        }
    }

    /// Whether this error is retriable
    #[inline]
    pub fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }

    /// Whether this error means a job was found missing
    pub fn is_not_found(&self) -> bool {
        self.category() == ErrorCategory::NotFound
    }

    /// Whether the job was left in a state that needs an operator
    pub fn requires_intervention(&self) -> bool {
        matches!(self, Self::UpdateAborted { resumed: false, .. })
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection error with source
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a transaction error
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            source: None,
        }
    }

    /// Create a query error
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: None,
            source: None,
        }
    }

    /// Create a query error with SQL
    pub fn query_with_sql(message: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: Some(sql.into()),
            source: None,
        }
    }

    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a not-found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Wrap this error with the intent of the statement that produced it
    pub fn with_intent(self, intent: impl Into<String>) -> Self {
        Self::Statement {
            intent: intent.into(),
            source: Box::new(self),
        }
    }

    /// Reclassify a failure raised by `begin` as `TransactionStart`
    pub(crate) fn into_begin_failure(self) -> Self {
        match self {
            Self::Connection { message, source } | Self::Transaction { message, source } => {
                Self::TransactionStart { message, source }
            }
            Self::Query {
                message, source, ..
            } => Self::TransactionStart { message, source },
            other => other,
        }
    }
}

impl From<validator::ValidationErrors> for ChangefeedError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let mut messages: Vec<String> = errors
            .field_errors()
            .iter()
            .flat_map(|(field, errs)| {
                errs.iter().map(move |e| match &e.message {
                    Some(message) => format!("{}: {}", field, message),
                    None => format!("{}: {}", field, e.code),
                })
            })
            .collect();
        messages.sort();
        Self::Validation(messages.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(
            ChangefeedError::connection("down").category(),
            ErrorCategory::Connection
        );
        assert_eq!(
            ChangefeedError::query("bad").category(),
            ErrorCategory::Query
        );
        assert_eq!(
            ChangefeedError::not_found("42").category(),
            ErrorCategory::NotFound
        );
        assert_eq!(
            ChangefeedError::validation("nope").category(),
            ErrorCategory::Validation
        );
    }

    #[test]
    fn test_retriable_errors() {
        let timeout = ChangefeedError::Timeout {
            job_id: "1".into(),
            target: "PAUSED".into(),
            last_observed: Some("running".into()),
            elapsed: Duration::from_secs(600),
        };
        assert!(timeout.is_retriable());
        assert!(ChangefeedError::connection("down").is_retriable());
        assert!(!ChangefeedError::validation("bad cursor").is_retriable());
        assert!(!ChangefeedError::query("syntax").is_retriable());
    }

    #[test]
    fn test_statement_error_keeps_source_category() {
        let err = ChangefeedError::connection("reset").with_intent("could not pause job 7");
        assert_eq!(err.category(), ErrorCategory::Connection);
        assert!(err.to_string().starts_with("could not pause job 7"));
        assert!(err.to_string().contains("reset"));
    }

    #[test]
    fn test_timeout_display() {
        let err = ChangefeedError::Timeout {
            job_id: "99".into(),
            target: "PAUSED".into(),
            last_observed: None,
            elapsed: Duration::from_secs(1),
        };
        let msg = err.to_string();
        assert!(msg.contains("99"));
        assert!(msg.contains("PAUSED"));
        assert!(msg.contains("none"));
    }

    #[test]
    fn test_update_aborted_intervention() {
        let stalled = ChangefeedError::UpdateAborted {
            job_id: "5".into(),
            phase: UpdatePhase::Altering,
            resumed: false,
            source: Box::new(ChangefeedError::query("table missing")),
        };
        assert!(stalled.requires_intervention());
        assert!(stalled.to_string().contains("manual intervention"));

        let recovered = ChangefeedError::UpdateAborted {
            job_id: "5".into(),
            phase: UpdatePhase::Altering,
            resumed: true,
            source: Box::new(ChangefeedError::query("table missing")),
        };
        assert!(!recovered.requires_intervention());
        assert_eq!(recovered.category(), ErrorCategory::Saga);
    }

    #[test]
    fn test_begin_failure_conversion() {
        let err = ChangefeedError::connection("closed").into_begin_failure();
        assert!(matches!(err, ChangefeedError::TransactionStart { .. }));
        assert_eq!(err.category(), ErrorCategory::Transaction);
    }
}
