//! PostgreSQL demo: a producer, a worker pool and a periodic stats report.
//!
//! # Prerequisites
//!
//! 1. PostgreSQL server running locally or accessible via network
//! 2. Database created: `createdb skua_demo`
//!
//! The schema is applied on startup via `PostgresQueueStore::migrate`.
//!
//! # Running the Example
//!
//! ```bash
//! export DATABASE_URL="postgres://localhost/skua_demo"
//! RUST_LOG=info cargo run --example postgres_demo --features postgres,subscriber
//! ```
//!
//! Ctrl-C stops the workers gracefully; otherwise the demo exits once the
//! backlog is drained.

use std::sync::Arc;

use chrono::Duration;
use serde_json::{json, Value};
use skua::persistence::{connect, PostgresQueueStore};
use skua::telemetry::init_tracing;
use skua::*;

const JOB_TYPES: [&str; 5] = [
    "send_email",
    "process_payment",
    "generate_report",
    "resize_image",
    "send_sms",
];

const JOB_COUNT: u64 = 40;

fn payload_for(job_type: &str, i: u64) -> Value {
    match job_type {
        "send_email" => json!({ "to": format!("user{i}@example.com"), "subject": "Welcome" }),
        "process_payment" => json!({ "order_id": i, "amount_cents": 1000 + i * 25, "currency": "USD" }),
        "generate_report" => json!({ "report_id": i, "format": "pdf" }),
        "resize_image" => json!({ "path": format!("/images/{i}.png"), "width": 800, "height": 600 }),
        _ => json!({ "phone": format!("+1555000{i:04}"), "message": "Your code is ready" }),
    }
}

/// Payments go first and run immediately; everything else is staggered.
fn request_for(i: u64) -> EnqueueRequest {
    let job_type = JOB_TYPES[(i % JOB_TYPES.len() as u64) as usize];
    let request = EnqueueRequest::new(job_type, payload_for(job_type, i));

    if job_type == "process_payment" {
        request.with_priority(1)
    } else {
        request.with_delay(Duration::seconds((i % 10) as i64))
    }
}

async fn produce(store: &PostgresQueueStore) -> anyhow::Result<()> {
    for i in 0..JOB_COUNT {
        let request = request_for(i);
        let job_type = request.job_type.clone();
        let id = store.enqueue(request).await?;
        tracing::info!(%id, %job_type, "enqueued");
    }
    Ok(())
}

async fn drained(store: &PostgresQueueStore) -> anyhow::Result<bool> {
    let totals = QueueStatsReport::collect(store, Duration::minutes(5))
        .await?
        .totals();
    Ok(totals.pending() == 0 && totals.processing_count == 0)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing(false);

    let persistence = PersistenceConfig::from_env()?;
    let pool = connect(&persistence).await?;
    let store = Arc::new(PostgresQueueStore::new(pool, QueueConfig::default()));
    store.migrate().await?;

    produce(&store).await?;

    let mut builder = RuntimeBuilder::new(RuntimeConfig::default().with_worker_count(4))
        .with_queue(Arc::clone(&store))
        .with_worker_config(WorkerConfig::new("demo"));
    for job_type in JOB_TYPES {
        builder = builder.with_handler(
            job_type,
            SimulatedWorkHandler::for_job_type(job_type).with_failure_probability(0.1),
        );
    }
    let runtime = builder.build()?;

    let monitor = Arc::clone(&store);
    let stats = runtime
        .run_until(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(5));
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("interrupt received, draining workers");
                        break;
                    }
                    _ = ticker.tick() => match drained(&monitor).await {
                        Ok(true) => break,
                        Ok(false) => {}
                        Err(err) => tracing::warn!(error = %err, "stats query failed"),
                    }
                }
            }
        })
        .await?;

    println!(
        "\nworkers: claimed={} completed={} retried={} failed={}\n",
        stats.claimed, stats.completed, stats.retried, stats.failed
    );
    println!("{}", QueueStatsReport::collect(&*store, Duration::minutes(5)).await?);

    Ok(())
}
