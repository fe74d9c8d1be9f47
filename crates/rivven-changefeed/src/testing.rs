//! Testing utilities for changefeed reconciliation
//!
//! [`MockCluster`] is an in-memory stand-in for the database side of the
//! changefeed lifecycle. It understands the control statements the
//! reconciler issues, keeps a job table, buffers transactional statements
//! until commit, and records every statement it receives.
//!
//! # Example
//!
//! ```rust,ignore
//! use rivven_changefeed::prelude::*;
//! use rivven_changefeed::testing::MockCluster;
//!
//! #[tokio::test(start_paused = true)]
//! async fn test_update() {
//!     let cluster = MockCluster::new().with_pause_delay(2);
//!     let reconciler = ChangefeedReconciler::default();
//!     let spec = ChangefeedSpec::new(["t1"], "kafka", "shop", "registry");
//!
//!     let mut record = reconciler.create(&cluster, &spec).await.unwrap();
//!     cluster.clear_log();
//!
//!     let desired = ChangefeedSpec { tables: vec!["t2".into()], ..spec };
//!     reconciler.update(&cluster, &mut record, &desired).await.unwrap();
//!     assert_eq!(cluster.mutations().len(), 4);
//! }
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::codec::EXTERNAL_SCHEME;
use crate::connection::{Connection, Row, Transaction};
use crate::error::{ChangefeedError, Result};
use crate::spec::JobId;

/// Job status strings used by the mock
pub mod status {
    /// Job is streaming
    pub const RUNNING: &str = "running";
    /// Pause accepted, not yet effective
    pub const PAUSE_REQUESTED: &str = "pause-requested";
    /// Job is paused
    pub const PAUSED: &str = "paused";
    /// Job was cancelled
    pub const CANCELED: &str = "canceled";
    /// Job failed
    pub const FAILED: &str = "failed";
}

/// A changefeed job held by [`MockCluster`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockJob {
    /// Streamed tables
    pub tables: Vec<String>,
    /// Sink connection name (without scheme)
    pub sink: String,
    /// Free-text description
    pub description: String,
    /// Current status
    pub status: String,
    pause_polls_left: u32,
}

impl MockJob {
    /// Running job with the given tables, sink and description
    pub fn running(
        tables: impl IntoIterator<Item = impl Into<String>>,
        sink: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            tables: tables.into_iter().map(Into::into).collect(),
            sink: sink.into(),
            description: description.into(),
            status: status::RUNNING.to_string(),
            pause_polls_left: 0,
        }
    }
}

#[derive(Debug)]
struct Failure {
    pattern: String,
    message: String,
    remaining: Option<u32>,
}

#[derive(Debug)]
struct ClusterState {
    jobs: BTreeMap<u64, MockJob>,
    next_id: u64,
    log: Vec<String>,
    failures: Vec<Failure>,
    pause_delay: u32,
    fail_begin: Option<String>,
}

impl Default for ClusterState {
    fn default() -> Self {
        Self {
            jobs: BTreeMap::new(),
            next_id: 1001,
            log: Vec::new(),
            failures: Vec::new(),
            pause_delay: 0,
            fail_begin: None,
        }
    }
}

/// A parsed statement
#[derive(Debug)]
enum Statement {
    Create { tables: Vec<String>, sink: String },
    Pause(u64),
    Resume(u64),
    Cancel(u64),
    Add(u64, String),
    Drop(u64, String),
    Describe(u64),
    Status(u64),
    RunningCheck(u64),
}

/// A mutation waiting for commit
#[derive(Debug)]
enum Effect {
    Create(u64, MockJob),
    Pause(u64),
    Resume(u64),
    Cancel(u64),
    Add(u64, String),
    Drop(u64, String),
}

fn parse_id(text: &str, sql: &str) -> Result<u64> {
    text.trim()
        .trim_end_matches(']')
        .parse()
        .map_err(|_| ChangefeedError::query_with_sql("invalid job id", sql))
}

fn between<'a>(text: &'a str, start: &str, end: &str) -> Option<&'a str> {
    let from = text.find(start)? + start.len();
    let len = text[from..].find(end)?;
    Some(&text[from..from + len])
}

impl Statement {
    fn parse(sql: &str) -> Result<Self> {
        let syntax = || ChangefeedError::query_with_sql("syntax error", sql);
        let lower = sql.to_ascii_lowercase();

        if let Some(rest) = sql.strip_prefix("CREATE CHANGEFEED FOR TABLE ") {
            let tables = between(rest, "", " INTO ").ok_or_else(syntax)?;
            let sink = between(rest, &format!("INTO \"{}", EXTERNAL_SCHEME), "\"")
                .ok_or_else(syntax)?;
            return Ok(Self::Create {
                tables: tables.split(", ").map(str::to_string).collect(),
                sink: sink.to_string(),
            });
        }
        if let Some(rest) = sql.strip_prefix("PAUSE JOB ") {
            return Ok(Self::Pause(parse_id(rest, sql)?));
        }
        if let Some(rest) = sql.strip_prefix("RESUME JOB ") {
            return Ok(Self::Resume(parse_id(rest, sql)?));
        }
        if let Some(rest) = sql.strip_prefix("CANCEL JOB ") {
            return Ok(Self::Cancel(parse_id(rest, sql)?));
        }
        if let Some(rest) = sql.strip_prefix("ALTER CHANGEFEED ") {
            let mut parts = rest.split_whitespace();
            let id = parse_id(parts.next().ok_or_else(syntax)?, sql)?;
            let action = parts.next().ok_or_else(syntax)?;
            let table = parts.next().ok_or_else(syntax)?.to_string();
            return match action {
                "ADD" => Ok(Self::Add(id, table)),
                "DROP" => Ok(Self::Drop(id, table)),
                _ => Err(syntax()),
            };
        }
        if let Some(rest) =
            lower.strip_prefix("select sink_uri,topics,description from [show changefeed job ")
        {
            return Ok(Self::Describe(parse_id(rest, sql)?));
        }
        if let Some(rest) = lower.strip_prefix("select status from [show job ") {
            return Ok(Self::Status(parse_id(rest, sql)?));
        }
        if let Some(rest) = lower.strip_prefix("select job_id from [show changefeed job ") {
            let id = rest.split(']').next().ok_or_else(syntax)?;
            return Ok(Self::RunningCheck(parse_id(id, sql)?));
        }
        Err(syntax())
    }
}

impl ClusterState {
    fn check_failure(&mut self, sql: &str) -> Result<()> {
        let Some(idx) = self.failures.iter().position(|f| sql.contains(&f.pattern)) else {
            return Ok(());
        };
        let failure = &mut self.failures[idx];
        let message = failure.message.clone();
        if let Some(remaining) = failure.remaining.as_mut() {
            *remaining -= 1;
            if *remaining == 0 {
                self.failures.remove(idx);
            }
        }
        Err(ChangefeedError::query_with_sql(message, sql))
    }

    fn job(&self, id: u64, sql: &str) -> Result<&MockJob> {
        self.jobs
            .get(&id)
            .ok_or_else(|| ChangefeedError::query_with_sql(format!("job {} not found", id), sql))
    }

    fn read(&mut self, statement: &Statement) -> Vec<Row> {
        match statement {
            Statement::Describe(id) => self
                .jobs
                .get(id)
                .map(|job| {
                    let sink_uri = format!("{}{}", EXTERNAL_SCHEME, job.sink);
                    let topics = job.tables.join(",");
                    vec![Row::from_pairs([
                        ("sink_uri", sink_uri.as_str()),
                        ("topics", topics.as_str()),
                        ("description", job.description.as_str()),
                    ])]
                })
                .unwrap_or_default(),
            Statement::Status(id) => match self.jobs.get_mut(id) {
                Some(job) => {
                    if job.status == status::PAUSE_REQUESTED {
                        job.pause_polls_left = job.pause_polls_left.saturating_sub(1);
                        if job.pause_polls_left == 0 {
                            job.status = status::PAUSED.to_string();
                        }
                    }
                    vec![Row::from_pairs([("status", job.status.as_str())])]
                }
                None => vec![],
            },
            Statement::RunningCheck(id) => match self.jobs.get(id) {
                Some(job) if job.status == status::RUNNING => {
                    let id = id.to_string();
                    vec![Row::from_pairs([("job_id", id.as_str())])]
                }
                _ => vec![],
            },
            _ => vec![],
        }
    }

    /// Validate a mutation against committed state
    fn prepare(&mut self, statement: Statement, sql: &str) -> Result<Effect> {
        match statement {
            Statement::Create { tables, sink } => {
                let id = self.next_id;
                self.next_id += 1;
                Ok(Effect::Create(id, MockJob::running(tables, sink, sql)))
            }
            Statement::Pause(id) => {
                let job = self.job(id, sql)?;
                if job.status != status::RUNNING {
                    return Err(ChangefeedError::query_with_sql(
                        format!(
                            "job with status {} cannot be requested to be paused",
                            job.status
                        ),
                        sql,
                    ));
                }
                Ok(Effect::Pause(id))
            }
            Statement::Resume(id) => {
                let job = self.job(id, sql)?;
                if job.status == status::CANCELED {
                    return Err(ChangefeedError::query_with_sql(
                        "job with status canceled cannot be requested to be resumed",
                        sql,
                    ));
                }
                Ok(Effect::Resume(id))
            }
            Statement::Cancel(id) => {
                let job = self.job(id, sql)?;
                if job.status == status::CANCELED {
                    return Err(ChangefeedError::query_with_sql(
                        "job with status canceled cannot be requested to be canceled",
                        sql,
                    ));
                }
                Ok(Effect::Cancel(id))
            }
            Statement::Add(id, table) => {
                let job = self.job(id, sql)?;
                if job.status != status::PAUSED {
                    return Err(ChangefeedError::query_with_sql(
                        format!("job {} is not paused", id),
                        sql,
                    ));
                }
                if job.tables.contains(&table) {
                    return Err(ChangefeedError::query_with_sql(
                        format!("target {} already exists", table),
                        sql,
                    ));
                }
                Ok(Effect::Add(id, table))
            }
            Statement::Drop(id, table) => {
                let job = self.job(id, sql)?;
                if job.status != status::PAUSED {
                    return Err(ChangefeedError::query_with_sql(
                        format!("job {} is not paused", id),
                        sql,
                    ));
                }
                if !job.tables.contains(&table) {
                    return Err(ChangefeedError::query_with_sql(
                        format!("target {} does not exist", table),
                        sql,
                    ));
                }
                Ok(Effect::Drop(id, table))
            }
            _ => Err(ChangefeedError::query_with_sql("not a mutation", sql)),
        }
    }

    fn apply(&mut self, effect: Effect) {
        let pause_delay = self.pause_delay;
        match effect {
            Effect::Create(id, job) => {
                self.jobs.insert(id, job);
            }
            Effect::Pause(id) => {
                if let Some(job) = self.jobs.get_mut(&id) {
                    if pause_delay == 0 {
                        job.status = status::PAUSED.to_string();
                    } else {
                        job.status = status::PAUSE_REQUESTED.to_string();
                        job.pause_polls_left = pause_delay;
                    }
                }
            }
            Effect::Resume(id) => self.set_status(id, status::RUNNING),
            Effect::Cancel(id) => self.set_status(id, status::CANCELED),
            Effect::Add(id, table) => {
                if let Some(job) = self.jobs.get_mut(&id) {
                    job.tables.push(table);
                }
            }
            Effect::Drop(id, table) => {
                if let Some(job) = self.jobs.get_mut(&id) {
                    job.tables.retain(|t| t != &table);
                }
            }
        }
    }

    fn set_status(&mut self, id: u64, new_status: &str) {
        if let Some(job) = self.jobs.get_mut(&id) {
            job.status = new_status.to_string();
        }
    }
}

/// In-memory changefeed cluster
#[derive(Debug, Clone, Default)]
pub struct MockCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl MockCluster {
    /// Create an empty cluster; job ids start at 1001
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `pause-requested` for `polls` status reads after each pause
    pub fn with_pause_delay(self, polls: u32) -> Self {
        self.state.lock().pause_delay = polls;
        self
    }

    /// Fail every statement containing `pattern`
    pub fn fail_on(&self, pattern: impl Into<String>, message: impl Into<String>) {
        self.state.lock().failures.push(Failure {
            pattern: pattern.into(),
            message: message.into(),
            remaining: None,
        });
    }

    /// Fail the next statement containing `pattern`
    pub fn fail_once(&self, pattern: impl Into<String>, message: impl Into<String>) {
        self.state.lock().failures.push(Failure {
            pattern: pattern.into(),
            message: message.into(),
            remaining: Some(1),
        });
    }

    /// Make `BEGIN` fail with a connection error
    pub fn fail_begin(&self, message: impl Into<String>) {
        self.state.lock().fail_begin = Some(message.into());
    }

    /// Remove all injected failures
    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.failures.clear();
        state.fail_begin = None;
    }

    /// Seed a job and return its id
    pub fn insert_job(&self, job: MockJob) -> JobId {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.jobs.insert(id, job);
        JobId::from(id)
    }

    /// Snapshot of a job
    pub fn job(&self, id: &JobId) -> Option<MockJob> {
        let id = id.as_str().parse().ok()?;
        self.state.lock().jobs.get(&id).cloned()
    }

    /// Force a job status
    pub fn set_status(&self, id: &JobId, new_status: &str) {
        if let Ok(id) = id.as_str().parse() {
            self.state.lock().set_status(id, new_status);
        }
    }

    /// Remove a job entirely
    pub fn remove_job(&self, id: &JobId) {
        if let Ok(id) = id.as_str().parse::<u64>() {
            self.state.lock().jobs.remove(&id);
        }
    }

    /// Number of jobs in any status
    pub fn job_count(&self) -> usize {
        self.state.lock().jobs.len()
    }

    /// Every statement received, including `BEGIN`/`COMMIT`/`ROLLBACK`
    pub fn statements(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }

    /// Received statements that change a job, in order
    pub fn mutations(&self) -> Vec<String> {
        self.state
            .lock()
            .log
            .iter()
            .filter(|sql| {
                !matches!(sql.as_str(), "BEGIN" | "COMMIT" | "ROLLBACK")
                    && !sql.to_ascii_lowercase().starts_with("select")
            })
            .cloned()
            .collect()
    }

    /// Forget recorded statements
    pub fn clear_log(&self) {
        self.state.lock().log.clear();
    }

    fn run(&self, sql: &str, pending: Option<&Mutex<Vec<Effect>>>) -> Result<Vec<Row>> {
        let mut state = self.state.lock();
        state.log.push(sql.to_string());
        state.check_failure(sql)?;

        let statement = Statement::parse(sql)?;
        if matches!(
            statement,
            Statement::Describe(_) | Statement::Status(_) | Statement::RunningCheck(_)
        ) {
            return Ok(state.read(&statement));
        }

        let effect = state.prepare(statement, sql)?;
        let rows = match &effect {
            Effect::Create(id, _) => {
                let id = id.to_string();
                vec![Row::from_pairs([("job_id", id.as_str())])]
            }
            _ => vec![],
        };
        match pending {
            Some(pending) => pending.lock().push(effect),
            None => state.apply(effect),
        }
        Ok(rows)
    }
}

#[async_trait]
impl Connection for MockCluster {
    async fn query(&self, sql: &str) -> Result<Vec<Row>> {
        self.run(sql, None)
    }

    async fn execute(&self, sql: &str) -> Result<u64> {
        self.run(sql, None).map(|rows| rows.len() as u64)
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        let mut state = self.state.lock();
        state.log.push("BEGIN".into());
        if let Some(message) = state.fail_begin.clone() {
            return Err(ChangefeedError::connection(message));
        }
        Ok(Box::new(MockTransaction {
            cluster: self.clone(),
            pending: Mutex::new(Vec::new()),
        }))
    }

    async fn is_valid(&self) -> bool {
        true
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Transaction on a [`MockCluster`]; mutations apply on commit
pub struct MockTransaction {
    cluster: MockCluster,
    pending: Mutex<Vec<Effect>>,
}

#[async_trait]
impl Transaction for MockTransaction {
    async fn query(&self, sql: &str) -> Result<Vec<Row>> {
        self.cluster.run(sql, Some(&self.pending))
    }

    async fn execute(&self, sql: &str) -> Result<u64> {
        self.cluster
            .run(sql, Some(&self.pending))
            .map(|rows| rows.len() as u64)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MockTransaction { cluster, pending } = *self;
        let mut state = cluster.state.lock();
        state.log.push("COMMIT".into());
        state.check_failure("COMMIT")?;
        for effect in pending.into_inner() {
            state.apply(effect);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.cluster.state.lock().log.push("ROLLBACK".into());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transaction_buffers_until_commit() {
        let cluster = MockCluster::new();
        let tx = cluster.begin().await.unwrap();
        let rows = tx
            .query("CREATE CHANGEFEED FOR TABLE a, b INTO \"external://k\" WITH diff")
            .await
            .unwrap();
        assert_eq!(rows[0].get(0), Some("1001"));
        assert_eq!(cluster.job_count(), 0);
        tx.commit().await.unwrap();

        let job = cluster.job(&JobId::new("1001").unwrap()).unwrap();
        assert_eq!(job.tables, vec!["a", "b"]);
        assert_eq!(job.sink, "k");
        assert_eq!(job.status, status::RUNNING);
    }

    #[tokio::test]
    async fn test_rollback_discards() {
        let cluster = MockCluster::new();
        let id = cluster.insert_job(MockJob::running(["a"], "k", ""));
        let tx = cluster.begin().await.unwrap();
        tx.execute(&format!("PAUSE JOB {}", id)).await.unwrap();
        tx.rollback().await.unwrap();
        assert_eq!(cluster.job(&id).unwrap().status, status::RUNNING);
    }

    #[tokio::test]
    async fn test_alter_requires_pause() {
        let cluster = MockCluster::new();
        let id = cluster.insert_job(MockJob::running(["a"], "k", ""));
        let err = cluster
            .execute(&format!("ALTER CHANGEFEED {} ADD b", id))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not paused"));
    }

    #[tokio::test]
    async fn test_pause_delay() {
        let cluster = MockCluster::new().with_pause_delay(2);
        let id = cluster.insert_job(MockJob::running(["a"], "k", ""));
        cluster.execute(&format!("PAUSE JOB {}", id)).await.unwrap();

        let status_sql = format!("SELECT status FROM [SHOW JOB {}]", id);
        let first = cluster.query_one(&status_sql).await.unwrap().unwrap();
        assert_eq!(first.get(0), Some(status::PAUSE_REQUESTED));
        let second = cluster.query_one(&status_sql).await.unwrap().unwrap();
        assert_eq!(second.get(0), Some(status::PAUSED));
    }

    #[tokio::test]
    async fn test_running_check_and_describe() {
        let cluster = MockCluster::new();
        let id = cluster.insert_job(MockJob::running(["a", "b"], "kafka", "CREATE ..."));
        let check = format!(
            "SELECT job_id FROM [SHOW changefeed JOB {}] where status='running'",
            id
        );
        let row = cluster.query_one(&check).await.unwrap().unwrap();
        assert_eq!(row.get(0), Some(id.as_str()));

        let describe = format!(
            "select sink_uri,topics,description from [show changefeed job {}]",
            id
        );
        let row = cluster.query_one(&describe).await.unwrap().unwrap();
        assert_eq!(row.get(0), Some("external://kafka"));
        assert_eq!(row.get(1), Some("a,b"));
        assert_eq!(row.get(2), Some("CREATE ..."));

        cluster.set_status(&id, status::FAILED);
        assert!(cluster.query_one(&check).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let cluster = MockCluster::new();
        let id = cluster.insert_job(MockJob::running(["a"], "k", ""));
        cluster.fail_once("PAUSE", "boom");
        let sql = format!("PAUSE JOB {}", id);
        assert!(cluster.execute(&sql).await.is_err());
        assert!(cluster.execute(&sql).await.is_ok());
        assert_eq!(cluster.mutations(), vec![sql.clone(), sql]);

        cluster.fail_begin("refused");
        assert!(cluster.begin().await.is_err());
    }
}
