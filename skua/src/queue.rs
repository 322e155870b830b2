use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::QueueError;
use crate::job::{Claim, DequeueRequest, EnqueueRequest, Job, JobId, JobStatus};
use crate::retry::FailOutcome;
use crate::telemetry;

/// Trait for queue backends that own the job table.
///
/// Every method is a single atomic transition against the store. `dequeue`
/// must never hand the same row to two callers, and must not block on rows
/// another claimant is holding.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Insert a new job and return its id.
    async fn enqueue(&self, request: EnqueueRequest) -> Result<JobId, QueueError>;

    /// Insert several jobs in one transaction. Either all are stored or none.
    async fn enqueue_many(
        &self,
        requests: Vec<EnqueueRequest>,
    ) -> Result<Vec<JobId>, QueueError>;

    /// Claim the best eligible job, or `None` if nothing is eligible.
    async fn dequeue(&self, request: DequeueRequest) -> Result<Option<Job>, QueueError>;

    /// Mark a claimed job completed. Completing a completed job is a no-op.
    ///
    /// Not fenced to a claim; workers report through [`Self::complete_claim`].
    async fn complete(&self, job_id: JobId) -> Result<(), QueueError>;

    /// Record a failure and either requeue the job or fail it permanently.
    async fn fail(
        &self,
        job_id: JobId,
        error: &str,
        retryable: bool,
    ) -> Result<FailOutcome, QueueError>;

    /// `complete`, fenced to one claim.
    ///
    /// Fails with [`QueueError::ClaimLost`] when the row was swept and is
    /// requeued, failed or held by a later claim.
    async fn complete_claim(&self, claim: &Claim) -> Result<(), QueueError>;

    /// `fail`, fenced to one claim. A row no longer held by `claim` is left
    /// alone and reported as [`FailOutcome::Unchanged`].
    async fn fail_claim(
        &self,
        claim: &Claim,
        error: &str,
        retryable: bool,
    ) -> Result<FailOutcome, QueueError>;

    /// Fetch a job row by id.
    async fn job(&self, job_id: JobId) -> Result<Option<Job>, QueueError>;
}

/// Error recorded on rows reclaimed by the stale-claim sweep.
pub const CLAIM_EXPIRED: &str = "claim expired";

/// Trait for reclaiming jobs whose worker disappeared mid-execution.
///
/// Stale rows are routed through the same failure decision as `fail`, so a
/// job that keeps crashing its workers still ends up `failed`.
#[async_trait]
pub trait StaleClaimScanner: Send + Sync {
    /// Requeue or fail `processing` rows claimed longer ago than `timeout`.
    /// Returns the number of rows touched.
    async fn requeue_stale_claims(&self, timeout: Duration) -> Result<u64, QueueError>;
}

/// Read-only aggregation over the job table.
#[async_trait]
pub trait QueueMonitor: Send + Sync {
    /// Per-type counts of jobs by status.
    async fn queue_stats(&self) -> Result<Vec<QueueStats>, QueueError>;

    /// Per-type activity within the trailing `window`.
    async fn throughput(&self, window: Duration) -> Result<Vec<Throughput>, QueueError>;
}

/// Counts for one job type.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub job_type: String,
    pub ready_count: u64,
    pub processing_count: u64,
    pub failed_count: u64,
    pub scheduled_count: u64,
    pub completed_count: u64,
}

impl QueueStats {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            ..Default::default()
        }
    }

    /// Count one row in `status`.
    pub fn record(&mut self, status: JobStatus) {
        match status {
            JobStatus::Scheduled => self.scheduled_count += 1,
            JobStatus::Ready => self.ready_count += 1,
            JobStatus::Processing => self.processing_count += 1,
            JobStatus::Completed => self.completed_count += 1,
            JobStatus::Failed => self.failed_count += 1,
        }
    }

    /// Jobs still waiting to be claimed.
    pub fn pending(&self) -> u64 {
        self.ready_count + self.scheduled_count
    }
}

/// Activity for one job type within a trailing window.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Throughput {
    pub job_type: String,
    pub enqueued: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Aggregate statistics sampled at one point in time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueStatsReport {
    pub sampled_at: DateTime<Utc>,
    /// Length of the throughput window in seconds.
    pub window_secs: i64,
    pub stats: Vec<QueueStats>,
    pub throughput: Vec<Throughput>,
}

impl QueueStatsReport {
    /// Sample both views from `monitor` and publish the per-type depths.
    pub async fn collect<M>(monitor: &M, window: Duration) -> Result<Self, QueueError>
    where
        M: QueueMonitor + ?Sized,
    {
        let stats = monitor.queue_stats().await?;
        for s in &stats {
            telemetry::set_queue_depth(&s.job_type, "ready", s.ready_count);
            telemetry::set_queue_depth(&s.job_type, "scheduled", s.scheduled_count);
            telemetry::set_queue_depth(&s.job_type, "processing", s.processing_count);
            telemetry::set_queue_depth(&s.job_type, "failed", s.failed_count);
        }

        Ok(Self {
            sampled_at: Utc::now(),
            window_secs: window.num_seconds(),
            stats,
            throughput: monitor.throughput(window).await?,
        })
    }

    pub fn for_type(&self, job_type: &str) -> Option<&QueueStats> {
        self.stats.iter().find(|s| s.job_type == job_type)
    }

    /// Totals across every job type.
    pub fn totals(&self) -> QueueStats {
        self.stats.iter().fold(QueueStats::new("total"), |mut acc, s| {
            acc.ready_count += s.ready_count;
            acc.processing_count += s.processing_count;
            acc.failed_count += s.failed_count;
            acc.scheduled_count += s.scheduled_count;
            acc.completed_count += s.completed_count;
            acc
        })
    }
}

impl fmt::Display for QueueStatsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<18} {:>8} {:>12} {:>8} {:>10} {:>10}",
            "job_type", "ready", "processing", "failed", "scheduled", "completed"
        )?;
        for s in &self.stats {
            writeln!(
                f,
                "{:<18} {:>8} {:>12} {:>8} {:>10} {:>10}",
                s.job_type,
                s.ready_count,
                s.processing_count,
                s.failed_count,
                s.scheduled_count,
                s.completed_count
            )?;
        }
        writeln!(f)?;
        writeln!(
            f,
            "throughput, last {}s: {:<8} {:>9} {:>10} {:>7}",
            self.window_secs,
            "",
            "enqueued",
            "completed",
            "failed"
        )?;
        for t in &self.throughput {
            writeln!(
                f,
                "{:<18} {:>22} {:>10} {:>7}",
                t.job_type, t.enqueued, t.completed, t.failed
            )?;
        }
        Ok(())
    }
}

/// Group jobs into per-type status counts, ordered by job type.
pub fn tally_stats<'a, I>(jobs: I) -> Vec<QueueStats>
where
    I: IntoIterator<Item = &'a Job>,
{
    let mut by_type: BTreeMap<&str, QueueStats> = BTreeMap::new();
    for job in jobs {
        by_type
            .entry(job.job_type.as_str())
            .or_insert_with(|| QueueStats::new(job.job_type.clone()))
            .record(job.status);
    }
    by_type.into_values().collect()
}

/// Per-type activity since `cutoff`, ordered by job type. Types with no
/// activity in the window are omitted.
pub fn tally_throughput<'a, I>(jobs: I, cutoff: DateTime<Utc>) -> Vec<Throughput>
where
    I: IntoIterator<Item = &'a Job>,
{
    let mut by_type: BTreeMap<&str, Throughput> = BTreeMap::new();
    for job in jobs {
        let enqueued = job.created_at > cutoff;
        let finished = job.finished_at.is_some_and(|at| at > cutoff);
        let completed = finished && job.status == JobStatus::Completed;
        let failed = finished && job.status == JobStatus::Failed;
        if !(enqueued || completed || failed) {
            continue;
        }

        let entry = by_type
            .entry(job.job_type.as_str())
            .or_insert_with(|| Throughput {
                job_type: job.job_type.clone(),
                ..Default::default()
            });
        entry.enqueued += u64::from(enqueued);
        entry.completed += u64::from(completed);
        entry.failed += u64::from(failed);
    }
    by_type.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(id: i64, job_type: &str, status: JobStatus, created_at: DateTime<Utc>) -> Job {
        Job {
            id: JobId(id),
            job_type: job_type.to_string(),
            payload: json!({}),
            priority: 0,
            run_at: created_at,
            status,
            claimed_by: None,
            claimed_at: None,
            attempts: 0,
            max_attempts: 3,
            last_error: None,
            created_at,
            updated_at: created_at,
            finished_at: status.is_terminal().then_some(created_at),
        }
    }

    #[test]
    fn test_tally_stats_groups_by_type() {
        let now = Utc::now();
        let jobs = vec![
            job(1, "send_sms", JobStatus::Ready, now),
            job(2, "send_email", JobStatus::Processing, now),
            job(3, "send_email", JobStatus::Failed, now),
            job(4, "send_email", JobStatus::Scheduled, now),
            job(5, "send_sms", JobStatus::Completed, now),
        ];

        let stats = tally_stats(&jobs);
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].job_type, "send_email");
        assert_eq!(stats[0].processing_count, 1);
        assert_eq!(stats[0].failed_count, 1);
        assert_eq!(stats[0].scheduled_count, 1);
        assert_eq!(stats[1].ready_count, 1);
        assert_eq!(stats[1].completed_count, 1);
        assert_eq!(stats[1].pending(), 1);
    }

    #[test]
    fn test_tally_throughput_respects_cutoff() {
        let now = Utc::now();
        let old = now - Duration::hours(2);
        let jobs = vec![
            job(1, "t", JobStatus::Completed, now),
            job(2, "t", JobStatus::Failed, now),
            job(3, "t", JobStatus::Completed, old),
            job(4, "old_only", JobStatus::Ready, old),
        ];

        let throughput = tally_throughput(&jobs, now - Duration::hours(1));
        assert_eq!(
            throughput,
            vec![Throughput {
                job_type: "t".into(),
                enqueued: 2,
                completed: 1,
                failed: 1,
            }]
        );
    }

    #[test]
    fn test_report_display_and_totals() {
        let report = QueueStatsReport {
            sampled_at: Utc::now(),
            window_secs: 3600,
            stats: vec![
                QueueStats {
                    job_type: "send_email".into(),
                    ready_count: 2,
                    processing_count: 1,
                    ..Default::default()
                },
                QueueStats {
                    job_type: "send_sms".into(),
                    failed_count: 4,
                    ..Default::default()
                },
            ],
            throughput: vec![],
        };

        let rendered = report.to_string();
        assert!(rendered.contains("send_email"));
        assert!(rendered.contains("processing"));

        let totals = report.totals();
        assert_eq!(totals.ready_count, 2);
        assert_eq!(totals.failed_count, 4);
        assert!(report.for_type("send_sms").is_some());
        assert!(report.for_type("resize_image").is_none());
    }
}
