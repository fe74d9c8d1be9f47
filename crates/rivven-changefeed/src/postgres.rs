//! PostgreSQL wire backend for rivven-changefeed
//!
//! CockroachDB speaks the PostgreSQL protocol. Statements go through the
//! simple-query protocol because `[SHOW ...]` sources cannot be prepared,
//! so all values arrive as text.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_postgres::{SimpleQueryMessage, SimpleQueryRow};
use tracing::{debug, warn};

use crate::config::ConnectionConfig;
use crate::connection::{Connection, Row, Transaction};
use crate::error::{ChangefeedError, Result};

fn convert_row(row: &SimpleQueryRow) -> Row {
    let columns: Vec<String> = row
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();
    let values = (0..columns.len())
        .map(|idx| row.get(idx).map(str::to_string))
        .collect();
    Row::new(columns, values)
}

async fn simple_query(client: &tokio_postgres::Client, sql: &str) -> Result<Vec<Row>> {
    let messages = client
        .simple_query(sql)
        .await
        .map_err(|e| query_error(e, sql))?;
    Ok(messages
        .iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(convert_row(row)),
            _ => None,
        })
        .collect())
}

async fn simple_execute(client: &tokio_postgres::Client, sql: &str) -> Result<u64> {
    let messages = client
        .simple_query(sql)
        .await
        .map_err(|e| query_error(e, sql))?;
    Ok(messages
        .iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::CommandComplete(n) => Some(*n),
            _ => None,
        })
        .sum())
}

fn query_error(e: tokio_postgres::Error, sql: &str) -> ChangefeedError {
    if e.is_closed() {
        return ChangefeedError::connection_with_source("connection closed", e);
    }
    let message = match e.as_db_error() {
        Some(db) => db.message().to_string(),
        None => e.to_string(),
    };
    ChangefeedError::Query {
        message,
        sql: Some(sql.to_string()),
        source: Some(Box::new(e)),
    }
}

fn transaction_error(e: tokio_postgres::Error) -> ChangefeedError {
    ChangefeedError::Transaction {
        message: e.to_string(),
        source: Some(Box::new(e)),
    }
}

/// PostgreSQL connection implementation
pub struct PgConnection {
    client: Arc<tokio_postgres::Client>,
    closed: AtomicBool,
}

impl PgConnection {
    /// Create a new connection from a tokio-postgres client
    pub fn new(client: tokio_postgres::Client) -> Self {
        Self {
            client: Arc::new(client),
            closed: AtomicBool::new(false),
        }
    }

    /// Get the underlying client
    pub fn client(&self) -> &tokio_postgres::Client {
        &self.client
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) || self.client.is_closed() {
            return Err(ChangefeedError::connection("connection is closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for PgConnection {
    async fn query(&self, sql: &str) -> Result<Vec<Row>> {
        self.ensure_open()?;
        simple_query(&self.client, sql).await
    }

    async fn execute(&self, sql: &str) -> Result<u64> {
        self.ensure_open()?;
        simple_execute(&self.client, sql).await
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        self.ensure_open()?;
        self.client
            .batch_execute("BEGIN")
            .await
            .map_err(transaction_error)?;

        Ok(Box::new(PgTransaction {
            client: Arc::clone(&self.client),
        }))
    }

    async fn is_valid(&self) -> bool {
        if self.closed.load(Ordering::Relaxed) {
            return false;
        }
        self.client.simple_query("SELECT 1").await.is_ok()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

/// PostgreSQL transaction
pub struct PgTransaction {
    client: Arc<tokio_postgres::Client>,
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn query(&self, sql: &str) -> Result<Vec<Row>> {
        simple_query(&self.client, sql).await
    }

    async fn execute(&self, sql: &str) -> Result<u64> {
        simple_execute(&self.client, sql).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.client
            .batch_execute("COMMIT")
            .await
            .map_err(transaction_error)
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.client
            .batch_execute("ROLLBACK")
            .await
            .map_err(transaction_error)
    }
}

/// Connect using `config`
pub async fn connect(config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
    let mut pg_config: tokio_postgres::Config = config
        .url
        .parse()
        .map_err(|e| ChangefeedError::connection_with_source("invalid connection url", e))?;
    pg_config.connect_timeout(config.connect_timeout());
    if let Some(name) = &config.application_name {
        pg_config.application_name(name);
    }

    debug!(url = %config.redacted_url(), "connecting");
    let (client, connection) = pg_config
        .connect(tokio_postgres::NoTls)
        .await
        .map_err(|e| ChangefeedError::connection_with_source("failed to connect", e))?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            warn!(error = %e, "connection error");
        }
    });

    Ok(Box::new(PgConnection::new(client)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_rejects_bad_url() {
        let config = ConnectionConfig::new("not a url at all ://");
        let err = match connect(&config).await {
            Ok(_) => panic!("expected an error"),
            Err(e) => e,
        };
        assert!(matches!(err, ChangefeedError::Connection { .. }));
    }
}
