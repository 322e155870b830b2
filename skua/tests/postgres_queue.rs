//! Integration tests for the Postgres store.
//!
//! Requires a running Postgres instance reachable through `DATABASE_URL`.
//! Run with: `cargo test --test postgres_queue --features postgres -- --ignored`

#![cfg(feature = "postgres")]

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Duration;
use futures::future::join_all;
use serde_json::json;
use skua::persistence::PostgresQueueStore;
use skua::*;
use sqlx::{PgPool, Row};
use uuid::Uuid;

async fn setup(config: QueueConfig) -> (PostgresQueueStore, String) {
    let pool = PgPool::connect(
        &std::env::var("DATABASE_URL").expect("DATABASE_URL required"),
    )
    .await
    .expect("connect");

    let store = PostgresQueueStore::new(pool, config);
    store.migrate().await.expect("migrate");

    // Each test owns a job type so runs do not see each other's rows.
    (store, format!("test-{}", Uuid::now_v7()))
}

fn claim(worker: &str, job_type: &str) -> DequeueRequest {
    DequeueRequest::new(worker).with_job_types([job_type])
}

async fn cleanup(pool: &PgPool, job_type: &str) {
    sqlx::query("DELETE FROM skua_jobs WHERE job_type = $1")
        .bind(job_type)
        .execute(pool)
        .await
        .ok();
}

/// Age a claim by moving `claimed_at` into the past.
async fn backdate_claim(pool: &PgPool, id: JobId, by_secs: i64) {
    sqlx::query(
        r#"
        UPDATE skua_jobs
        SET claimed_at = claimed_at - ($1::bigint) * INTERVAL '1 second'
        WHERE id = $2
        "#,
    )
    .bind(by_secs)
    .bind(id.get())
    .execute(pool)
    .await
    .expect("backdate_claim");
}

#[tokio::test]
#[ignore] // requires DATABASE_URL
async fn round_trip_through_postgres() {
    let (store, job_type) = setup(QueueConfig::default()).await;

    let id = store
        .enqueue(EnqueueRequest::new(&job_type, json!({"x": 1})))
        .await
        .expect("enqueue");

    let job = store
        .dequeue(claim("w1", &job_type))
        .await
        .expect("dequeue")
        .expect("job available");
    assert_eq!(job.id, id);
    assert_eq!(job.payload, json!({"x": 1}));
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.claimed_by.as_deref(), Some("w1"));
    assert_eq!(job.max_attempts, 3);

    store.complete(id).await.expect("complete");
    store.complete(id).await.expect("complete is idempotent");

    let stats = store.queue_stats().await.expect("stats");
    let ours = stats.iter().find(|s| s.job_type == job_type).expect("row");
    assert_eq!(ours.processing_count, 0);
    assert_eq!(ours.completed_count, 1);

    cleanup(store.pool(), &job_type).await;
}

#[tokio::test]
#[ignore] // requires DATABASE_URL
async fn concurrent_claims_are_disjoint() {
    let (store, job_type) = setup(QueueConfig::default()).await;
    let store = Arc::new(store);

    let requests = (0..40)
        .map(|n| EnqueueRequest::new(&job_type, json!({ "n": n })))
        .collect();
    store.enqueue_many(requests).await.expect("enqueue_many");

    let claims = join_all((0..60).map(|w| {
        let store = Arc::clone(&store);
        let job_type = job_type.clone();
        async move {
            store
                .dequeue(claim(&format!("w{w}"), &job_type))
                .await
                .expect("dequeue")
        }
    }))
    .await;

    let ids: Vec<JobId> = claims.into_iter().flatten().map(|job| job.id).collect();
    let unique: HashSet<JobId> = ids.iter().copied().collect();
    assert_eq!(ids.len(), 40);
    assert_eq!(unique.len(), 40);

    cleanup(store.pool(), &job_type).await;
}

#[tokio::test]
#[ignore] // requires DATABASE_URL
async fn priority_and_delay_order_claims() {
    let (store, job_type) = setup(QueueConfig::default()).await;

    for priority in [1, 5, 3] {
        store
            .enqueue(EnqueueRequest::new(&job_type, json!({})).with_priority(priority))
            .await
            .expect("enqueue");
    }
    let delayed = store
        .enqueue(
            EnqueueRequest::new(&job_type, json!({}))
                .with_priority(100)
                .with_delay(Duration::seconds(60)),
        )
        .await
        .expect("enqueue delayed");

    let mut order = Vec::new();
    while let Some(job) = store.dequeue(claim("w1", &job_type)).await.expect("dequeue") {
        order.push(job.priority);
    }
    assert_eq!(order, vec![5, 3, 1]);

    let row = store.job(delayed).await.expect("job").expect("row");
    assert_eq!(row.status, JobStatus::Scheduled);

    cleanup(store.pool(), &job_type).await;
}

/// max_attempts=1: the first retryable failure requeues (0 < 1), the second
/// is terminal.
#[tokio::test]
#[ignore] // requires DATABASE_URL
async fn fail_honours_per_job_max_attempts() {
    let (store, job_type) = setup(QueueConfig::default().without_backoff()).await;

    let id = store
        .enqueue(EnqueueRequest::new(&job_type, json!({})).with_max_attempts(1))
        .await
        .expect("enqueue");

    store.dequeue(claim("w1", &job_type)).await.expect("dequeue").expect("job");
    let first = store.fail(id, "err1", true).await.expect("fail 1");
    assert!(matches!(first, FailOutcome::Retrying { attempts: 1, .. }));
    assert_eq!(
        store.job(id).await.expect("job").expect("row").status,
        JobStatus::Ready
    );

    store.dequeue(claim("w1", &job_type)).await.expect("dequeue").expect("job");
    let second = store.fail(id, "err2", true).await.expect("fail 2");
    assert_eq!(second, FailOutcome::Failed { attempts: 2 });

    let row = sqlx::query("SELECT status, attempts, last_error FROM skua_jobs WHERE id = $1")
        .bind(id.get())
        .fetch_one(store.pool())
        .await
        .expect("select");
    assert_eq!(row.try_get::<String, _>("status").unwrap(), "failed");
    assert_eq!(row.try_get::<i32, _>("attempts").unwrap(), 2);
    assert_eq!(row.try_get::<String, _>("last_error").unwrap(), "err2");

    let again = store.fail(id, "late", true).await.expect("fail terminal");
    assert_eq!(again, FailOutcome::Unchanged { status: JobStatus::Failed });

    cleanup(store.pool(), &job_type).await;
}

#[tokio::test]
#[ignore] // requires DATABASE_URL
async fn backoff_schedules_retry() {
    let (store, job_type) = setup(QueueConfig::default()).await;

    let id = store
        .enqueue(EnqueueRequest::new(&job_type, json!({})))
        .await
        .expect("enqueue");
    store.dequeue(claim("w1", &job_type)).await.expect("dequeue").expect("job");

    let outcome = store.fail(id, "boom", true).await.expect("fail");
    assert!(matches!(outcome, FailOutcome::Retrying { attempts: 1, .. }));

    let row = store.job(id).await.expect("job").expect("row");
    assert_eq!(row.status, JobStatus::Scheduled);
    assert!(row.claimed_by.is_none());
    assert!(store.dequeue(claim("w1", &job_type)).await.expect("dequeue").is_none());

    cleanup(store.pool(), &job_type).await;
}

#[tokio::test]
#[ignore] // requires DATABASE_URL
async fn protocol_errors_are_reported() {
    let (store, job_type) = setup(QueueConfig::default()).await;

    let err = store.complete(JobId(i64::MAX)).await.unwrap_err();
    assert!(matches!(err, QueueError::UnknownJob(_)));

    let id = store
        .enqueue(EnqueueRequest::new(&job_type, json!({})))
        .await
        .expect("enqueue");
    let err = store.complete(id).await.unwrap_err();
    assert!(matches!(
        err,
        QueueError::InvalidTransition {
            status: JobStatus::Ready,
            ..
        }
    ));

    cleanup(store.pool(), &job_type).await;
}

#[tokio::test]
#[ignore] // requires DATABASE_URL
async fn stale_claims_are_requeued() {
    let (store, job_type) = setup(QueueConfig::default().without_backoff()).await;

    let id = store
        .enqueue(EnqueueRequest::new(&job_type, json!({})))
        .await
        .expect("enqueue");
    store.dequeue(claim("crashed", &job_type)).await.expect("dequeue").expect("job");

    backdate_claim(store.pool(), id, 600).await;
    let touched = store
        .requeue_stale_claims(Duration::seconds(300))
        .await
        .expect("sweep");
    assert!(touched >= 1);

    let row = store.job(id).await.expect("job").expect("row");
    assert_eq!(row.status, JobStatus::Ready);
    assert_eq!(row.attempts, 1);
    assert_eq!(row.last_error.as_deref(), Some(CLAIM_EXPIRED));

    cleanup(store.pool(), &job_type).await;
}

#[tokio::test]
#[ignore] // requires DATABASE_URL
async fn locked_row_is_skipped_without_waiting() {
    let (store, job_type) = setup(QueueConfig::default()).await;

    let top = store
        .enqueue(EnqueueRequest::new(&job_type, json!({})).with_priority(5))
        .await
        .expect("enqueue");
    let next = store
        .enqueue(EnqueueRequest::new(&job_type, json!({})).with_priority(1))
        .await
        .expect("enqueue");

    // Another session holds the top row's lock until rollback.
    let mut tx = store.pool().begin().await.expect("begin");
    sqlx::query("SELECT id FROM skua_jobs WHERE id = $1 FOR UPDATE")
        .bind(top.get())
        .fetch_one(&mut *tx)
        .await
        .expect("lock top row");

    let job = tokio::time::timeout(
        std::time::Duration::from_secs(2),
        store.dequeue(claim("w1", &job_type)),
    )
    .await
    .expect("dequeue must not block on a locked row")
    .expect("dequeue")
    .expect("job available");
    assert_eq!(job.id, next);

    tx.rollback().await.expect("rollback");
    let job = store
        .dequeue(claim("w1", &job_type))
        .await
        .expect("dequeue")
        .expect("job available");
    assert_eq!(job.id, top);

    cleanup(store.pool(), &job_type).await;
}

#[tokio::test]
#[ignore] // requires DATABASE_URL
async fn swept_claim_cannot_report_over_a_newer_claim() {
    let (store, job_type) = setup(QueueConfig::default().without_backoff()).await;

    let id = store
        .enqueue(EnqueueRequest::new(&job_type, json!({})))
        .await
        .expect("enqueue");
    let first = store
        .dequeue(claim("a", &job_type))
        .await
        .expect("dequeue")
        .expect("job");
    let stale = first.claim().expect("claim");

    backdate_claim(store.pool(), id, 600).await;
    store
        .requeue_stale_claims(Duration::seconds(300))
        .await
        .expect("sweep");
    let second = store
        .dequeue(claim("b", &job_type))
        .await
        .expect("dequeue")
        .expect("job");
    let current = second.claim().expect("claim");

    let outcome = store.fail_claim(&stale, "late", true).await.expect("fail");
    assert_eq!(outcome, FailOutcome::Unchanged { status: JobStatus::Processing });
    let err = store.complete_claim(&stale).await.unwrap_err();
    assert!(matches!(
        err,
        QueueError::ClaimLost { status: JobStatus::Processing, .. }
    ));

    let row = store.job(id).await.expect("job").expect("row");
    assert_eq!(row.claimed_by.as_deref(), Some("b"));
    assert_eq!(row.attempts, 1);
    assert!(store
        .dequeue(claim("c", &job_type))
        .await
        .expect("dequeue")
        .is_none());

    store.complete_claim(&current).await.expect("complete");
    let row = store.job(id).await.expect("job").expect("row");
    assert_eq!(row.status, JobStatus::Completed);

    cleanup(store.pool(), &job_type).await;
}
