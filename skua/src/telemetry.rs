//! Tracing and telemetry instrumentation for skua.
//!
//! Span constructors for each queue operation and helpers that record job
//! lifecycle outcomes. Every helper logs through `tracing`; with the
//! `metrics` feature enabled it also updates the Prometheus series in
//! [`crate::metrics`].
//!
//! # Example
//!
//! ```ignore
//! use skua::telemetry::{job_execute_span, record_job_start, record_job_finished};
//!
//! let span = job_execute_span("42", "send_email", "worker-1");
//! let _enter = span.enter();
//! let timing = record_job_start("42");
//! // ... run the handler
//! record_job_finished(timing, "send_email", "completed");
//! ```

use std::future::Future;
use tracing::{info_span, Instrument, Span};

/// Span for an enqueue.
#[must_use]
pub fn job_enqueue_span(job_type: impl AsRef<str>, priority: i32) -> Span {
    info_span!(
        "skua.enqueue",
        job_type = %job_type.as_ref(),
        priority = priority,
    )
}

/// Span for a claim attempt.
#[must_use]
pub fn job_dequeue_span(worker_id: impl AsRef<str>) -> Span {
    info_span!("skua.dequeue", worker_id = %worker_id.as_ref())
}

/// Span covering handler execution for one job.
#[must_use]
pub fn job_execute_span(
    job_id: impl AsRef<str>,
    job_type: impl AsRef<str>,
    worker_id: impl AsRef<str>,
) -> Span {
    info_span!(
        "skua.execute",
        job_id = %job_id.as_ref(),
        job_type = %job_type.as_ref(),
        worker_id = %worker_id.as_ref(),
    )
}

/// Span for a complete transition.
#[must_use]
pub fn job_complete_span(job_id: impl AsRef<str>) -> Span {
    info_span!("skua.complete", job_id = %job_id.as_ref())
}

/// Span for a fail transition.
#[must_use]
pub fn job_fail_span(job_id: impl AsRef<str>, retryable: bool) -> Span {
    info_span!(
        "skua.fail",
        job_id = %job_id.as_ref(),
        retryable = retryable,
    )
}

/// Span for one stale-claim sweep.
#[must_use]
pub fn sweep_span(timeout_secs: i64) -> Span {
    info_span!("skua.sweep", timeout_secs = timeout_secs)
}

/// Attach an execute span to a handler future.
pub fn instrument_execute<F>(
    job_id: impl AsRef<str>,
    job_type: impl AsRef<str>,
    worker_id: impl AsRef<str>,
    future: F,
) -> impl Future<Output = F::Output>
where
    F: Future,
{
    future.instrument(job_execute_span(job_id, job_type, worker_id))
}

/// Record a job enqueue.
pub fn record_job_enqueued(job_type: impl AsRef<str>, priority: i32) {
    tracing::debug!(
        job_type = %job_type.as_ref(),
        priority = priority,
        "job enqueued"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_enqueued(job_type.as_ref());
}

/// Record a reported outcome.
///
/// `status` is one of `completed`, `retrying`, `failed`.
pub fn record_job_outcome(job_type: impl AsRef<str>, status: impl AsRef<str>) {
    tracing::debug!(
        job_type = %job_type.as_ref(),
        status = %status.as_ref(),
        "job outcome recorded"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_outcome(job_type.as_ref(), status.as_ref());
}

/// Record claims requeued or failed by the stale-claim sweep.
pub fn record_stale_claims(count: u64) {
    if count == 0 {
        return;
    }
    tracing::warn!(count = count, "stale claims reclaimed");

    #[cfg(feature = "metrics")]
    crate::metrics::record_stale_claims(count);
}

/// Publish per-type pending counts to the queue depth gauge.
pub fn set_queue_depth(job_type: impl AsRef<str>, status: impl AsRef<str>, depth: u64) {
    tracing::trace!(
        job_type = %job_type.as_ref(),
        status = %status.as_ref(),
        depth = depth,
        "queue depth updated"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::set_queue_depth(job_type.as_ref(), status.as_ref(), depth as f64);
}

/// Record the start of job execution.
pub fn record_job_start(job_id: impl AsRef<str>) -> JobTimingHandle {
    JobTimingHandle {
        job_id: job_id.as_ref().to_string(),
        start: std::time::Instant::now(),
    }
}

/// Record the end of job execution and the outcome it led to.
pub fn record_job_finished(
    handle: JobTimingHandle,
    job_type: impl AsRef<str>,
    status: impl AsRef<str>,
) -> std::time::Duration {
    let duration = handle.start.elapsed();

    tracing::info!(
        job_id = %handle.job_id,
        job_type = %job_type.as_ref(),
        status = %status.as_ref(),
        duration_ms = duration.as_millis() as u64,
        "job finished"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::observe_job_duration(
        job_type.as_ref(),
        status.as_ref(),
        duration.as_secs_f64(),
    );

    record_job_outcome(job_type, status);
    duration
}

/// Handle for tracking job execution duration.
#[derive(Debug)]
pub struct JobTimingHandle {
    job_id: String,
    start: std::time::Instant,
}

impl JobTimingHandle {
    #[must_use]
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    #[must_use]
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}

/// Install a `RUST_LOG`-driven fmt subscriber (default level `info`).
///
/// Safe to call more than once; later calls are no-ops.
#[cfg(feature = "subscriber")]
pub fn init_tracing(json: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
