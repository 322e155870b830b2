//! Producer, workers and an event observer on the in-memory store.
//!
//! Runs without a database:
//!
//! ```bash
//! cargo run --example in_memory_workers
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use skua::*;
use skua_testkit::InMemoryQueueStore;
use tokio::sync::broadcast::error::RecvError;

#[derive(Debug, Serialize, Deserialize)]
struct Email {
    to: String,
    subject: String,
}

/// Typed handler: decodes the payload and rejects addresses it cannot send to.
struct EmailHandler;

#[async_trait]
impl JobHandler for EmailHandler {
    async fn handle(&self, job: &Job) -> Result<(), HandlerError> {
        let email: Email = job.payload_as()?;
        if !email.to.contains('@') {
            return Err(HandlerError::permanent(format!("invalid address {}", email.to)));
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        println!("   sent {:?} to {}", email.subject, email.to);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let store = Arc::new(InMemoryQueueStore::new().with_config(
        QueueConfig {
            retry_base_delay_ms: 50,
            ..QueueConfig::default()
        },
    ));
    let events = InProcEventBus::new(256);

    println!("1. Enqueueing jobs...");
    let recipients = ["ada@example.com", "grace@example.com", "not-an-address"];
    for (i, to) in recipients.iter().enumerate() {
        let email = Email {
            to: to.to_string(),
            subject: format!("Newsletter #{i}"),
        };
        let request = EnqueueRequest::typed("send_email", &email)?;
        let priority = request.priority;
        let id = store.enqueue(request).await?;
        events.publish(JobEvent::new(id, "send_email", None, JobEventPayload::Enqueued { priority }));
    }
    for i in 0..6 {
        let request = EnqueueRequest::new("resize_image", serde_json::json!({ "image": i }))
            .with_priority(i % 3)
            .with_delay(Duration::milliseconds(100 * i as i64));
        store.enqueue(request).await?;
    }

    println!("2. Starting observer and workers...");
    let mut rx = events.subscribe();
    let observer = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => println!(
                    "   [{}] job {} ({}): {:?}",
                    event.worker_id.as_deref().unwrap_or("producer"),
                    event.job_id,
                    event.job_type,
                    event.payload
                ),
                Err(RecvError::Lagged(skipped)) => println!("   observer skipped {skipped} events"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let runtime = RuntimeBuilder::new(RuntimeConfig::default().with_worker_count(3))
        .with_queue(Arc::clone(&store))
        .with_worker_config(WorkerConfig::new("local").with_poll_interval(25))
        .with_handler("send_email", EmailHandler)
        .with_handler(
            "resize_image",
            SimulatedWorkHandler::for_job_type("resize_image")
                .scaled(0.05)
                .with_failure_probability(0.3),
        )
        .with_events(events)
        .build()?;

    let waiter = Arc::clone(&store);
    let stats = runtime
        .run_until(async move {
            loop {
                let totals = match QueueStatsReport::collect(&*waiter, Duration::minutes(1)).await {
                    Ok(report) => report.totals(),
                    Err(_) => break,
                };
                if totals.pending() == 0 && totals.processing_count == 0 {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
        })
        .await?;

    // The runtime held the last sender; dropping it closes the observer.
    drop(runtime);
    let _ = observer.await;

    println!(
        "\n3. Workers: claimed={} completed={} retried={} failed={}\n",
        stats.claimed, stats.completed, stats.retried, stats.failed
    );
    println!("{}", QueueStatsReport::collect(&*store, Duration::minutes(1)).await?);

    Ok(())
}
