//! Connection traits for rivven-changefeed
//!
//! Core abstractions for talking to the database:
//! - Connection: statement execution and transaction start
//! - Transaction: statements inside an explicit transaction
//! - TransactionScope: commit on success, rollback on failure or drop
//!
//! Control statements are plain text with no bind parameters, and the
//! `[SHOW ...]` sources only speak the simple-query protocol, so every value
//! comes back as text.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{ChangefeedError, Result};

/// A result row with text-encoded values
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Option<String>>,
}

impl Row {
    /// Create a row from column names and values
    pub fn new(columns: Vec<String>, values: Vec<Option<String>>) -> Self {
        Self { columns, values }
    }

    /// Build a row from `(column, value)` pairs
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let (columns, values) = pairs
            .into_iter()
            .map(|(c, v)| (c.to_string(), Some(v.to_string())))
            .unzip();
        Self { columns, values }
    }

    /// Column names
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Number of values
    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the row has no values
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Value by position; `None` for NULL or out of range
    pub fn get(&self, index: usize) -> Option<&str> {
        self.values.get(index).and_then(|v| v.as_deref())
    }

    /// Value by column name (case-insensitive)
    pub fn get_by_name(&self, name: &str) -> Option<&str> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .and_then(|idx| self.get(idx))
    }
}

/// A connection to the database
#[async_trait]
pub trait Connection: Send + Sync {
    /// Execute a statement that returns rows
    async fn query(&self, sql: &str) -> Result<Vec<Row>>;

    /// Execute a statement, returns affected row count
    async fn execute(&self, sql: &str) -> Result<u64>;

    /// Execute a statement and return the first row (convenience method)
    async fn query_one(&self, sql: &str) -> Result<Option<Row>> {
        let rows = self.query(sql).await?;
        Ok(rows.into_iter().next())
    }

    /// Begin a transaction
    async fn begin(&self) -> Result<Box<dyn Transaction>>;

    /// Check if connection is valid/alive
    async fn is_valid(&self) -> bool;

    /// Close the connection
    async fn close(&self) -> Result<()>;
}

/// A database transaction
#[async_trait]
pub trait Transaction: Send + Sync {
    /// Execute a statement that returns rows
    async fn query(&self, sql: &str) -> Result<Vec<Row>>;

    /// Execute a statement
    async fn execute(&self, sql: &str) -> Result<u64>;

    /// Execute a statement and return the first row
    async fn query_one(&self, sql: &str) -> Result<Option<Row>> {
        let rows = self.query(sql).await?;
        Ok(rows.into_iter().next())
    }

    /// Commit the transaction
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Rollback the transaction
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// A transaction that ends exactly once
///
/// Use [`finish`](Self::finish) to commit an `Ok` outcome or roll back an
/// `Err` one. A scope dropped without finishing (cancelled future, panic)
/// spawns a rollback on the current runtime.
///
/// ```rust,ignore
/// let scope = TransactionScope::begin(conn).await?;
/// let outcome = async {
///     scope.execute("PAUSE JOB 42").await?;
///     Ok::<_, ChangefeedError>(())
/// }
/// .await;
/// scope.finish(outcome).await?;
/// ```
pub struct TransactionScope {
    tx: Option<Box<dyn Transaction>>,
}

impl TransactionScope {
    /// Begin a transaction on `conn`
    ///
    /// Any failure is reported as [`ChangefeedError::TransactionStart`].
    pub async fn begin(conn: &dyn Connection) -> Result<Self> {
        let tx = conn
            .begin()
            .await
            .map_err(ChangefeedError::into_begin_failure)?;
        Ok(Self { tx: Some(tx) })
    }

    fn tx(&self) -> Result<&dyn Transaction> {
        self.tx
            .as_deref()
            .ok_or_else(|| ChangefeedError::transaction("transaction already finished"))
    }

    /// Execute a statement inside the transaction
    pub async fn execute(&self, sql: &str) -> Result<u64> {
        debug!(sql, "executing statement");
        self.tx()?.execute(sql).await
    }

    /// Execute a statement and return its first row
    pub async fn query_one(&self, sql: &str) -> Result<Option<Row>> {
        debug!(sql, "executing query");
        self.tx()?.query_one(sql).await
    }

    /// Commit the transaction
    pub async fn commit(mut self) -> Result<()> {
        match self.tx.take() {
            Some(tx) => tx.commit().await,
            None => Err(ChangefeedError::transaction("transaction already finished")),
        }
    }

    /// Roll the transaction back
    pub async fn rollback(mut self) -> Result<()> {
        match self.tx.take() {
            Some(tx) => tx.rollback().await,
            None => Ok(()),
        }
    }

    /// Commit on `Ok`, roll back on `Err`
    ///
    /// A failed rollback is logged; the original error is returned.
    pub async fn finish<T>(self, outcome: Result<T>) -> Result<T> {
        match outcome {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.rollback().await {
                    warn!(error = %rollback_err, "rollback failed");
                }
                Err(err)
            }
        }
    }
}

impl Drop for TransactionScope {
    fn drop(&mut self) {
        let Some(tx) = self.tx.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = tx.rollback().await {
                        warn!(error = %e, "rollback of abandoned transaction failed");
                    }
                });
            }
            Err(_) => warn!("transaction dropped outside a runtime, not rolled back"),
        }
    }
}

impl std::fmt::Debug for TransactionScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionScope")
            .field("open", &self.tx.is_some())
            .finish()
    }
}
