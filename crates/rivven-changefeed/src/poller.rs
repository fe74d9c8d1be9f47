//! Job status polling
//!
//! Pause and resume are asynchronous in the database: the statement returns
//! before the job transitions. [`StatusPoller`] re-reads the status on a
//! fixed interval until it matches, or reports a timeout.

use async_trait::async_trait;
use std::time::Duration;
use tokio::time::{interval_at, sleep_until, timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, instrument};

use crate::codec::ControlStatement;
use crate::connection::Connection;
use crate::error::{ChangefeedError, Result};
use crate::spec::JobId;

/// Default interval between two status reads
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default upper bound on a status wait
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(600);

/// Something that can report a job's current status
#[async_trait]
pub trait StatusSource: Send + Sync {
    /// Read the job status; a missing job is [`ChangefeedError::NotFound`]
    async fn job_status(&self, job_id: &JobId) -> Result<String>;
}

/// [`StatusSource`] backed by `SHOW JOB` on a connection
pub struct JobStatusQuery<'a> {
    conn: &'a dyn Connection,
}

impl<'a> JobStatusQuery<'a> {
    /// Read status through `conn`
    pub fn new(conn: &'a dyn Connection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl StatusSource for JobStatusQuery<'_> {
    async fn job_status(&self, job_id: &JobId) -> Result<String> {
        let statement = ControlStatement::Status(job_id);
        let row = self
            .conn
            .query_one(&statement.to_string())
            .await
            .map_err(|e| e.with_intent(statement.intent()))?
            .ok_or_else(|| ChangefeedError::not_found(job_id.as_str()))?;
        row.get(0)
            .map(str::to_string)
            .ok_or_else(|| ChangefeedError::query(format!("job {} has a NULL status", job_id)))
    }
}

/// Waits for a job to reach a target status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusPoller {
    interval: Duration,
    timeout: Duration,
}

impl Default for StatusPoller {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL, DEFAULT_WAIT_TIMEOUT)
    }
}

impl StatusPoller {
    /// Create a poller; a zero interval is raised to one millisecond
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval: interval.max(Duration::from_millis(1)),
            timeout,
        }
    }

    /// Interval between reads
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Upper bound on a wait
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait until the job status equals `target`, ignoring ASCII case
    ///
    /// The first read happens one interval after the call. Returns the
    /// observed status on success. A failed read aborts the wait at once;
    /// only a non-matching status leads to another cycle. Dropping the
    /// future cancels the wait.
    #[instrument(skip(self, source, job_id), fields(job_id = %job_id))]
    pub async fn wait_for_status(
        &self,
        source: &dyn StatusSource,
        job_id: &JobId,
        target: &str,
    ) -> Result<String> {
        let start = Instant::now();
        let deadline = start + self.timeout;
        let mut ticker = interval_at(start + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_observed = None;

        loop {
            tokio::select! {
                _ = sleep_until(deadline) => break,
                _ = ticker.tick() => {}
            }

            let status = match timeout_at(deadline, source.job_status(job_id)).await {
                Ok(read) => read?,
                Err(_) => break,
            };
            debug!(status = %status, target, "observed job status");

            if status.eq_ignore_ascii_case(target) {
                return Ok(status);
            }
            last_observed = Some(status);
        }

        Err(ChangefeedError::Timeout {
            job_id: job_id.to_string(),
            target: target.to_string(),
            last_observed,
            elapsed: start.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Replays a fixed sequence of statuses, repeating the last one
    struct Script(Mutex<VecDeque<Result<String>>>);

    impl Script {
        fn new(items: Vec<Result<String>>) -> Self {
            Self(Mutex::new(items.into()))
        }
    }

    #[async_trait]
    impl StatusSource for Script {
        async fn job_status(&self, _job_id: &JobId) -> Result<String> {
            let mut items = self.0.lock();
            if items.len() > 1 {
                return items.pop_front().unwrap();
            }
            match items.front() {
                Some(Ok(status)) => Ok(status.clone()),
                Some(Err(_)) => items.pop_front().unwrap(),
                None => Err(ChangefeedError::not_found("exhausted")),
            }
        }
    }

    fn job() -> JobId {
        JobId::new("42").unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_case_insensitive_match() {
        let source = Script::new(vec![Ok("Paused".into())]);
        let poller = StatusPoller::default();
        let status = poller
            .wait_for_status(&source, &job(), "PAUSED")
            .await
            .unwrap();
        assert_eq!(status, "Paused");
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_through_transition() {
        let source = Script::new(vec![
            Ok("running".into()),
            Ok("pause-requested".into()),
            Ok("paused".into()),
        ]);
        let poller = StatusPoller::new(Duration::from_secs(1), Duration::from_secs(10));
        let start = Instant::now();
        poller
            .wait_for_status(&source, &job(), "paused")
            .await
            .unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(3) && elapsed < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_reports_last_status() {
        let source = Script::new(vec![Ok("running".into())]);
        let poller = StatusPoller::new(Duration::from_secs(1), Duration::from_secs(5));
        let err = poller
            .wait_for_status(&source, &job(), "paused")
            .await
            .unwrap_err();
        match err {
            ChangefeedError::Timeout {
                job_id,
                target,
                last_observed,
                ..
            } => {
                assert_eq!(job_id, "42");
                assert_eq!(target, "paused");
                assert_eq!(last_observed.as_deref(), Some("running"));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_error_aborts() {
        let source = Script::new(vec![
            Ok("running".into()),
            Err(ChangefeedError::connection("reset")),
            Ok("paused".into()),
        ]);
        let poller = StatusPoller::default();
        let err = poller
            .wait_for_status(&source, &job(), "paused")
            .await
            .unwrap_err();
        assert!(matches!(err, ChangefeedError::Connection { .. }));
    }

    #[test]
    fn test_zero_interval_is_raised() {
        let poller = StatusPoller::new(Duration::ZERO, Duration::from_secs(1));
        assert_eq!(poller.interval(), Duration::from_millis(1));
    }
}
