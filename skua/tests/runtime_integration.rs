//! Runtime integration tests for the skua worker pool.
//!
//! Covers exactly-once completion across workers, retries, permanent
//! failures, panicking handlers, graceful drain and the stale-claim sweep.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use skua::*;
use skua_testkit::{numbered_request, InMemoryQueueStore, MockHandler};
use tokio::sync::broadcast;
use tokio::time::timeout;

fn test_store() -> Arc<InMemoryQueueStore> {
    Arc::new(InMemoryQueueStore::new().with_config(QueueConfig::default().without_backoff()))
}

fn fast_worker() -> WorkerConfig {
    WorkerConfig::new("test")
        .with_poll_interval(10)
        .with_error_backoff(10)
}

fn builder(store: &Arc<InMemoryQueueStore>, workers: usize) -> RuntimeBuilder<InMemoryQueueStore> {
    RuntimeBuilder::new(RuntimeConfig::default().with_shutdown_grace_ms(5_000))
        .with_queue(Arc::clone(store))
        .with_worker_count(workers)
        .with_worker_config(fast_worker())
}

/// Poll `condition` until it holds or the deadline passes.
async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let result = timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {what}");
}

async fn next_event(rx: &mut broadcast::Receiver<JobEvent>) -> JobEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("event should arrive")
        .expect("bus should stay open")
}

#[tokio::test]
async fn every_job_completes_exactly_once() {
    let store = test_store();
    let handler = MockHandler::new();
    let ids = store
        .enqueue_many((0..200).map(|n| numbered_request("t", n)).collect())
        .await
        .unwrap();

    let runtime = builder(&store, 8)
        .with_handler("t", handler.clone())
        .build()
        .unwrap();

    let waiter = store.clone();
    let stats = runtime
        .run_until(wait_for("all jobs completed", move || {
            waiter.count_in(JobStatus::Completed) == 200
        }))
        .await
        .unwrap();

    assert_eq!(stats.claimed, 200);
    assert_eq!(stats.completed, 200);
    handler.assert_call_count_eq(200);
    for id in ids {
        assert_eq!(handler.calls_for(id), 1, "job {id} ran more than once");
    }

    let workers: HashSet<String> = handler
        .records()
        .into_iter()
        .filter_map(|r| r.worker_id)
        .collect();
    assert!(workers.iter().all(|w| w.starts_with("test-w")));
}

#[tokio::test]
async fn retryable_failure_then_success() {
    let store = test_store();
    let handler = MockHandler::new();
    handler.push_result(Err(HandlerError::retryable("flaky upstream")));

    let id = store.enqueue(numbered_request("t", 1)).await.unwrap();
    let runtime = builder(&store, 1)
        .with_handler("t", handler.clone())
        .build()
        .unwrap();
    runtime.start().await.unwrap();

    wait_for("completion", || store.count_in(JobStatus::Completed) == 1).await;
    let stats = runtime.shutdown().await.unwrap();

    assert_eq!(stats.retried, 1);
    assert_eq!(stats.completed, 1);
    let attempts: Vec<i32> = handler.records().iter().map(|r| r.attempts).collect();
    assert_eq!(attempts, vec![0, 1]);

    let job = store.job(id).await.unwrap().unwrap();
    assert_eq!(job.attempts, 1);
    assert_eq!(job.last_error.as_deref(), Some("flaky upstream"));
}

#[tokio::test]
async fn permanent_failure_is_not_retried() {
    let store = test_store();
    let handler = MockHandler::failing(HandlerError::permanent("invalid recipient"));

    let id = store.enqueue(numbered_request("t", 1)).await.unwrap();
    let runtime = builder(&store, 2)
        .with_handler("t", handler.clone())
        .build()
        .unwrap();
    runtime.start().await.unwrap();

    wait_for("terminal failure", || store.count_in(JobStatus::Failed) == 1).await;
    let stats = runtime.shutdown().await.unwrap();

    assert_eq!(stats.failed, 1);
    handler.assert_call_count_eq(1);
    let job = store.job(id).await.unwrap().unwrap();
    assert_eq!(job.attempts, 1);
    assert_eq!(job.last_error.as_deref(), Some("invalid recipient"));
}

#[tokio::test]
async fn retryable_failures_exhaust_max_attempts() {
    let store = test_store();
    let handler = MockHandler::failing(HandlerError::retryable("still down"));

    let id = store
        .enqueue(numbered_request("t", 1).with_max_attempts(2))
        .await
        .unwrap();
    let runtime = builder(&store, 2)
        .with_handler("t", handler.clone())
        .build()
        .unwrap();
    runtime.start().await.unwrap();

    wait_for("terminal failure", || store.count_in(JobStatus::Failed) == 1).await;
    runtime.shutdown().await.unwrap();

    handler.assert_call_count_eq(3);
    assert_eq!(store.job(id).await.unwrap().unwrap().attempts, 3);
}

#[tokio::test]
async fn panicking_handler_counts_as_retryable_failure() {
    let store = test_store();
    let handler = MockHandler::panicking("kaboom");

    let id = store
        .enqueue(numbered_request("t", 1).with_max_attempts(1))
        .await
        .unwrap();
    let runtime = builder(&store, 1)
        .with_handler("t", handler.clone())
        .build()
        .unwrap();
    runtime.start().await.unwrap();

    wait_for("terminal failure", || store.count_in(JobStatus::Failed) == 1).await;
    let stats = runtime.shutdown().await.unwrap();

    // One retry, then the ceiling.
    handler.assert_call_count_eq(2);
    assert_eq!(stats.retried, 1);
    assert_eq!(stats.failed, 1);
    let job = store.job(id).await.unwrap().unwrap();
    assert!(job.last_error.unwrap_or_default().contains("kaboom"));
}

#[tokio::test]
async fn job_without_handler_fails_permanently() {
    let store = test_store();
    let handler = MockHandler::new();

    let orphan = store.enqueue(numbered_request("orphan", 1)).await.unwrap();
    let runtime = builder(&store, 1)
        .with_handler("t", handler.clone())
        .with_worker_config(fast_worker().with_job_types(["t", "orphan"]))
        .build()
        .unwrap();
    runtime.start().await.unwrap();

    wait_for("terminal failure", || store.count_in(JobStatus::Failed) == 1).await;
    runtime.shutdown().await.unwrap();

    handler.assert_call_count_eq(0);
    let job = store.job(orphan).await.unwrap().unwrap();
    assert_eq!(job.attempts, 1);
    assert!(job
        .last_error
        .unwrap_or_default()
        .contains("no handler registered"));
}

#[tokio::test]
async fn default_filter_skips_unhandled_types() {
    let store = test_store();
    let handler = MockHandler::new();

    let other = store.enqueue(numbered_request("other", 1)).await.unwrap();
    let mine = store.enqueue(numbered_request("t", 2)).await.unwrap();
    let runtime = builder(&store, 1)
        .with_handler("t", handler.clone())
        .build()
        .unwrap();
    runtime.start().await.unwrap();

    wait_for("completion", || store.count_in(JobStatus::Completed) == 1).await;
    runtime.shutdown().await.unwrap();

    assert_eq!(handler.calls_for(mine), 1);
    assert_eq!(store.job(other).await.unwrap().unwrap().status, JobStatus::Ready);
}

#[tokio::test]
async fn shutdown_drains_in_flight_job() {
    let store = test_store();
    let handler = MockHandler::new().with_delay(Duration::from_millis(300));

    let id = store.enqueue(numbered_request("t", 1)).await.unwrap();
    let runtime = builder(&store, 1)
        .with_handler("t", handler.clone())
        .build()
        .unwrap();
    runtime.start().await.unwrap();

    wait_for("claim", || store.count_in(JobStatus::Processing) == 1).await;
    let stats = runtime.shutdown().await.unwrap();

    assert_eq!(stats.completed, 1);
    assert_eq!(store.job(id).await.unwrap().unwrap().status, JobStatus::Completed);

    // Nothing is claimed after shutdown.
    store.enqueue(numbered_request("t", 2)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.count_in(JobStatus::Ready), 1);
}

#[tokio::test]
async fn start_twice_is_rejected() {
    let store = test_store();
    let runtime = builder(&store, 1)
        .with_handler("t", MockHandler::new())
        .build()
        .unwrap();

    runtime.start().await.unwrap();
    assert!(runtime.start().await.is_err());
    runtime.shutdown().await.unwrap();
    assert!(runtime.start().await.is_err());
}

#[tokio::test]
async fn builder_requires_queue_and_handlers() {
    let store = test_store();

    let missing_queue = RuntimeBuilder::<InMemoryQueueStore>::new(RuntimeConfig::default())
        .with_handler("t", MockHandler::new())
        .build();
    assert!(missing_queue.is_err());

    let missing_handlers = builder(&store, 1).build();
    assert!(missing_handlers.is_err());

    let zero_workers = builder(&store, 0).with_handler("t", MockHandler::new()).build();
    assert!(zero_workers.is_err());
}

#[tokio::test]
async fn lifecycle_events_are_published() {
    let store = test_store();
    let events = InProcEventBus::new(64);
    let mut rx = events.subscribe();

    let handler = MockHandler::new();
    handler.push_result(Err(HandlerError::retryable("once")));

    let id = store.enqueue(numbered_request("t", 1)).await.unwrap();
    let runtime = builder(&store, 1)
        .with_handler("t", handler)
        .with_events(events)
        .build()
        .unwrap();
    runtime.start().await.unwrap();

    let claimed = next_event(&mut rx).await;
    assert_eq!(claimed.job_id, id);
    assert_eq!(claimed.payload, JobEventPayload::Claimed { attempts: 0 });

    let retrying = next_event(&mut rx).await;
    assert!(matches!(
        retrying.payload,
        JobEventPayload::Retrying { attempts: 1, ref error, .. } if error == "once"
    ));

    let reclaimed = next_event(&mut rx).await;
    assert_eq!(reclaimed.payload, JobEventPayload::Claimed { attempts: 1 });

    let completed = next_event(&mut rx).await;
    assert!(matches!(completed.payload, JobEventPayload::Completed { .. }));
    assert_eq!(completed.worker_id.as_deref(), Some("test-w0"));

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn sweeper_recovers_abandoned_claim() {
    let store = test_store();
    let handler = MockHandler::new();

    let id = store.enqueue(numbered_request("t", 1)).await.unwrap();
    store
        .dequeue(DequeueRequest::new("crashed-worker"))
        .await
        .unwrap()
        .unwrap();

    let runtime = RuntimeBuilder::new(
        RuntimeConfig::default()
            .with_stale_claim_timeout_ms(50)
            .with_sweep_interval_ms(20)
            .with_shutdown_grace_ms(5_000),
    )
    .with_queue(Arc::clone(&store))
    .with_worker_count(1)
    .with_worker_config(fast_worker())
    .with_handler("t", handler.clone())
    .build()
    .unwrap();
    runtime.start().await.unwrap();

    wait_for("recovered completion", || store.count_in(JobStatus::Completed) == 1).await;
    runtime.shutdown().await.unwrap();

    let records = handler.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].attempts, 1);
    assert_eq!(records[0].worker_id.as_deref(), Some("test-w0"));

    let job = store.job(id).await.unwrap().unwrap();
    assert_eq!(job.last_error.as_deref(), Some(CLAIM_EXPIRED));
}
