//! Status polling against the in-memory cluster

use rivven_changefeed::connection::Connection;
use rivven_changefeed::error::ChangefeedError;
use rivven_changefeed::poller::{JobStatusQuery, StatusPoller};
use rivven_changefeed::spec::JobId;
use rivven_changefeed::testing::{status, MockCluster, MockJob};
use std::time::Duration;

fn poller() -> StatusPoller {
    StatusPoller::new(Duration::from_secs(1), Duration::from_secs(30))
}

#[tokio::test(start_paused = true)]
async fn test_mixed_case_status_matches() {
    let cluster = MockCluster::new();
    let id = cluster.insert_job(MockJob::running(["t1"], "kafka", ""));
    cluster.set_status(&id, "Paused");

    let observed = poller()
        .wait_for_status(&JobStatusQuery::new(&cluster), &id, "PAUSED")
        .await
        .unwrap();
    assert_eq!(observed, "Paused");
}

#[tokio::test(start_paused = true)]
async fn test_waits_for_pause_to_take_effect() {
    let cluster = MockCluster::new().with_pause_delay(3);
    let id = cluster.insert_job(MockJob::running(["t1"], "kafka", ""));
    cluster.execute(&format!("PAUSE JOB {}", id)).await.unwrap();

    let observed = poller()
        .wait_for_status(&JobStatusQuery::new(&cluster), &id, status::PAUSED)
        .await
        .unwrap();
    assert_eq!(observed, status::PAUSED);

    let status_reads = cluster
        .statements()
        .iter()
        .filter(|s| s.starts_with("SELECT status"))
        .count();
    assert_eq!(status_reads, 3);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_when_status_never_matches() {
    let cluster = MockCluster::new();
    let id = cluster.insert_job(MockJob::running(["t1"], "kafka", ""));

    let poller = StatusPoller::new(Duration::from_secs(1), Duration::from_secs(4));
    let err = poller
        .wait_for_status(&JobStatusQuery::new(&cluster), &id, "paused")
        .await
        .unwrap_err();

    assert!(err.is_retriable());
    match err {
        ChangefeedError::Timeout { last_observed, .. } => {
            assert_eq!(last_observed.as_deref(), Some(status::RUNNING))
        }
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_missing_job_aborts_wait() {
    let cluster = MockCluster::new();
    let id = JobId::from(4242);

    let err = poller()
        .wait_for_status(&JobStatusQuery::new(&cluster), &id, "paused")
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(cluster.statements().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_query_failure_aborts_wait() {
    let cluster = MockCluster::new();
    let id = cluster.insert_job(MockJob::running(["t1"], "kafka", ""));
    cluster.fail_on("SHOW JOB", "connection reset by peer");

    let err = poller()
        .wait_for_status(&JobStatusQuery::new(&cluster), &id, "paused")
        .await
        .unwrap_err();
    assert!(matches!(err, ChangefeedError::Statement { .. }));
    assert!(err.to_string().contains("connection reset by peer"));
}
