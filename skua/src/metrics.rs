//! Prometheus metrics instrumentation for skua.
//!
//! All metrics are conditionally compiled behind the `metrics` feature flag.
//!
//! # Metrics
//!
//! ## Counters
//! - `skua_jobs_enqueued_total` - Jobs enqueued, by job type
//! - `skua_job_outcomes_total` - Reported outcomes (completed, retrying, failed)
//! - `skua_stale_claims_total` - Claims reclaimed by the stale-claim sweep
//!
//! ## Gauges
//! - `skua_queue_depth` - Rows per job type and status, as last sampled
//!
//! ## Histograms
//! - `skua_job_duration_seconds` - Handler execution time
#![cfg(feature = "metrics")]

use prometheus::{exponential_buckets, CounterVec, GaugeVec, HistogramVec, IntCounter, Opts, Registry};
use std::sync::LazyLock;

/// Global Prometheus registry for skua metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static JOBS_ENQUEUED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("skua_jobs_enqueued_total", "Total number of jobs enqueued");
    CounterVec::new(opts, &["job_type"]).expect("skua_jobs_enqueued_total metric creation failed")
});

pub static JOB_OUTCOMES_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "skua_job_outcomes_total",
        "Total number of job outcomes reported by workers",
    );
    CounterVec::new(opts, &["job_type", "status"])
        .expect("skua_job_outcomes_total metric creation failed")
});

pub static STALE_CLAIMS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "skua_stale_claims_total",
        "Total number of stale claims reclaimed by the sweep",
    )
    .expect("skua_stale_claims_total metric creation failed")
});

pub static QUEUE_DEPTH: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new("skua_queue_depth", "Rows per job type and status");
    GaugeVec::new(opts, &["job_type", "status"]).expect("skua_queue_depth metric creation failed")
});

pub static JOB_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.001, 2.0, 15).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "skua_job_duration_seconds",
        "Job handler execution duration in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["job_type", "status"])
        .expect("skua_job_duration_seconds metric creation failed")
});

/// Register all metrics with [`REGISTRY`]. Idempotent.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(JOBS_ENQUEUED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(JOB_OUTCOMES_TOTAL.clone()),
        Box::new(STALE_CLAIMS_TOTAL.clone()),
        Box::new(QUEUE_DEPTH.clone()),
        Box::new(JOB_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            if !matches!(e, prometheus::Error::AlreadyReg) {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_job_enqueued(job_type: &str) {
    JOBS_ENQUEUED_TOTAL.with_label_values(&[job_type]).inc();
}

pub fn record_job_outcome(job_type: &str, status: &str) {
    JOB_OUTCOMES_TOTAL
        .with_label_values(&[job_type, status])
        .inc();
}

pub fn record_stale_claims(count: u64) {
    STALE_CLAIMS_TOTAL.inc_by(count);
}

pub fn set_queue_depth(job_type: &str, status: &str, depth: f64) {
    QUEUE_DEPTH.with_label_values(&[job_type, status]).set(depth);
}

pub fn observe_job_duration(job_type: &str, status: &str, duration_secs: f64) {
    JOB_DURATION_SECONDS
        .with_label_values(&[job_type, status])
        .observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
