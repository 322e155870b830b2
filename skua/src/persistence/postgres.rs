use std::time::Duration as StdDuration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, warn, Instrument};

use crate::config::{PersistenceConfig, QueueConfig};
use crate::error::QueueError;
use crate::job::{Claim, DequeueRequest, EnqueueRequest, Job, JobId, JobStatus};
use crate::queue::{
    QueueMonitor, QueueStats, QueueStore, StaleClaimScanner, Throughput, CLAIM_EXPIRED,
};
use crate::retry::{decide_failure, FailOutcome, FailureDecision};
use crate::telemetry;

const SCHEMA: &str = include_str!("../../migrations/001_initial_schema.sql");

/// Open a connection pool, retrying with a doubling delay.
pub async fn connect(config: &PersistenceConfig) -> anyhow::Result<PgPool> {
    let attempts = config.connect_retries.max(1);
    let mut delay = StdDuration::from_millis(config.connect_retry_delay_ms);
    let mut attempt = 1;

    loop {
        let result = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(StdDuration::from_secs(config.acquire_timeout_seconds))
            .connect(&config.connection_string)
            .await;

        match result {
            Ok(pool) => return Ok(pool),
            Err(err) if attempt < attempts => {
                warn!(
                    attempt,
                    attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %err,
                    "database connection failed"
                );
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("database unreachable after {attempts} attempts"))
            }
        }
    }
}

/// PostgreSQL-backed queue store over the `skua_jobs` table.
///
/// The pool is owned by the caller; cloning the store shares it.
#[derive(Clone, Debug)]
pub struct PostgresQueueStore {
    pool: PgPool,
    config: QueueConfig,
}

impl PostgresQueueStore {
    pub fn new(pool: PgPool, config: QueueConfig) -> Self {
        Self { pool, config }
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Create the job table and its indexes if they do not exist.
    pub async fn migrate(&self) -> Result<(), QueueError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        debug!("skua schema applied");
        Ok(())
    }

    async fn insert(
        tx: &mut Transaction<'_, Postgres>,
        request: &EnqueueRequest,
        max_attempts: i32,
    ) -> Result<JobId, QueueError> {
        let delay_ms = request.delay.num_milliseconds().max(0);

        let row = sqlx::query(
            r#"
            INSERT INTO skua_jobs (
                job_type, payload, priority, run_at, status,
                attempts, max_attempts, created_at, updated_at
            )
            VALUES ($1, $2, $3, NOW() + ($4::bigint) * INTERVAL '1 millisecond', $5,
                    0, $6, NOW(), NOW())
            RETURNING id
            "#,
        )
        .bind(&request.job_type)
        .bind(&request.payload)
        .bind(request.priority)
        .bind(delay_ms)
        .bind(request.initial_status().as_str())
        .bind(max_attempts)
        .fetch_one(&mut **tx)
        .await?;

        Ok(JobId(row.try_get("id")?))
    }

    async fn lock_row(
        tx: &mut Transaction<'_, Postgres>,
        job_id: JobId,
    ) -> Result<Option<LockedRow>, QueueError> {
        let row = sqlx::query(
            r#"
            SELECT status, claimed_by, claimed_at, attempts, max_attempts, NOW() AS now
            FROM skua_jobs
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(job_id.0)
        .fetch_optional(&mut **tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let status: String = row.try_get("status")?;
        Ok(Some(LockedRow {
            id: job_id,
            status: status.parse()?,
            claimed_by: row.try_get("claimed_by")?,
            claimed_at: row.try_get("claimed_at")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            now: row.try_get("now")?,
        }))
    }

    /// Complete `job_id`, optionally only while `claim` still holds it.
    async fn complete_row(&self, job_id: JobId, claim: Option<&Claim>) -> Result<(), QueueError> {
        let span = telemetry::job_complete_span(job_id.to_string());
        async move {
            let mut tx = self.pool.begin().await?;

            let Some(locked) = Self::lock_row(&mut tx, job_id).await? else {
                return Err(QueueError::UnknownJob(job_id));
            };

            match locked.status {
                JobStatus::Processing if locked.held_by(claim) => {
                    sqlx::query(
                        r#"
                        UPDATE skua_jobs
                        SET status = 'completed',
                            claimed_by = NULL,
                            claimed_at = NULL,
                            updated_at = NOW(),
                            finished_at = NOW()
                        WHERE id = $1
                        "#,
                    )
                    .bind(job_id.0)
                    .execute(&mut *tx)
                    .await?;
                    tx.commit().await?;
                    debug!("job completed");
                    Ok(())
                }
                JobStatus::Completed => {
                    debug!("job already completed");
                    Ok(())
                }
                status if claim.is_some() => Err(QueueError::ClaimLost { id: job_id, status }),
                status => Err(QueueError::InvalidTransition {
                    id: job_id,
                    status,
                    operation: "complete",
                }),
            }
        }
        .instrument(span)
        .await
    }

    /// Fail `job_id`, optionally only while `claim` still holds it.
    async fn fail_row(
        &self,
        job_id: JobId,
        claim: Option<&Claim>,
        error: &str,
        retryable: bool,
    ) -> Result<FailOutcome, QueueError> {
        let span = telemetry::job_fail_span(job_id.to_string(), retryable);
        async move {
            let mut tx = self.pool.begin().await?;

            let Some(locked) = Self::lock_row(&mut tx, job_id).await? else {
                return Err(QueueError::UnknownJob(job_id));
            };
            let status = locked.status;

            if status.is_terminal() {
                debug!(%status, "fail on terminal job ignored");
                return Ok(FailOutcome::Unchanged { status });
            }
            if status != JobStatus::Processing || !locked.held_by(claim) {
                if claim.is_some() {
                    debug!(%status, "fail on a lost claim ignored");
                    return Ok(FailOutcome::Unchanged { status });
                }
                return Err(QueueError::InvalidTransition {
                    id: job_id,
                    status,
                    operation: "fail",
                });
            }

            let decision = self
                .apply_failure(&mut tx, &locked, error, retryable)
                .await?;
            tx.commit().await?;

            match &decision {
                FailureDecision::Retry {
                    attempts, run_at, ..
                } => warn!(attempts, %run_at, error, "job failed, retry scheduled"),
                FailureDecision::Fail { attempts } => {
                    warn!(attempts, max_attempts = locked.max_attempts, error, "job failed permanently")
                }
            }
            Ok(decision.into())
        }
        .instrument(span)
        .await
    }

    /// Write the outcome of [`decide_failure`] for a locked `processing` row.
    async fn apply_failure(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        row: &LockedRow,
        error: &str,
        retryable: bool,
    ) -> Result<FailureDecision, QueueError> {
        let job_id = row.id;
        let decision = decide_failure(
            row.attempts,
            row.max_attempts,
            retryable,
            row.now,
            &self.config.retry_policy(),
        );

        match &decision {
            FailureDecision::Retry {
                attempts,
                status,
                run_at,
            } => {
                sqlx::query(
                    r#"
                    UPDATE skua_jobs
                    SET attempts = $2,
                        status = $3,
                        run_at = $4,
                        claimed_by = NULL,
                        claimed_at = NULL,
                        last_error = $5,
                        updated_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(job_id.0)
                .bind(*attempts)
                .bind(status.as_str())
                .bind(*run_at)
                .bind(error)
                .execute(&mut **tx)
                .await?;
            }
            FailureDecision::Fail { attempts } => {
                sqlx::query(
                    r#"
                    UPDATE skua_jobs
                    SET attempts = $2,
                        status = 'failed',
                        claimed_by = NULL,
                        claimed_at = NULL,
                        last_error = $3,
                        updated_at = NOW(),
                        finished_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(job_id.0)
                .bind(*attempts)
                .bind(error)
                .execute(&mut **tx)
                .await?;
            }
        }

        Ok(decision)
    }
}

/// A row locked `FOR UPDATE`, with the database clock read in the same statement.
struct LockedRow {
    id: JobId,
    status: JobStatus,
    claimed_by: Option<String>,
    claimed_at: Option<DateTime<Utc>>,
    attempts: i32,
    max_attempts: i32,
    now: DateTime<Utc>,
}

impl LockedRow {
    /// Unfenced reports always pass.
    fn held_by(&self, claim: Option<&Claim>) -> bool {
        claim.map_or(true, |c| c.holds(self.claimed_by.as_deref(), self.claimed_at))
    }
}

fn job_from_row(row: &PgRow) -> Result<Job, QueueError> {
    let status: String = row.try_get("status")?;
    Ok(Job {
        id: JobId(row.try_get("id")?),
        job_type: row.try_get("job_type")?,
        payload: row.try_get("payload")?,
        priority: row.try_get("priority")?,
        run_at: row.try_get("run_at")?,
        status: status.parse()?,
        claimed_by: row.try_get("claimed_by")?,
        claimed_at: row.try_get("claimed_at")?,
        attempts: row.try_get("attempts")?,
        max_attempts: row.try_get("max_attempts")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        finished_at: row.try_get("finished_at")?,
    })
}

fn count(row: &PgRow, column: &str) -> Result<u64, QueueError> {
    let value: i64 = row.try_get(column)?;
    Ok(value.max(0) as u64)
}

#[async_trait]
impl QueueStore for PostgresQueueStore {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<JobId, QueueError> {
        let span = telemetry::job_enqueue_span(&request.job_type, request.priority);
        async move {
            let max_attempts = request.validate(self.config.default_max_attempts)?;

            let mut tx = self.pool.begin().await?;
            let id = Self::insert(&mut tx, &request, max_attempts).await?;
            tx.commit().await?;

            telemetry::record_job_enqueued(&request.job_type, request.priority);
            debug!(job_id = %id, "job inserted");
            Ok(id)
        }
        .instrument(span)
        .await
    }

    async fn enqueue_many(
        &self,
        requests: Vec<EnqueueRequest>,
    ) -> Result<Vec<JobId>, QueueError> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let max_attempts = requests
            .iter()
            .map(|r| r.validate(self.config.default_max_attempts))
            .collect::<Result<Vec<_>, _>>()?;

        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(requests.len());
        for (request, max_attempts) in requests.iter().zip(max_attempts) {
            ids.push(Self::insert(&mut tx, request, max_attempts).await?);
        }
        tx.commit().await?;

        for request in &requests {
            telemetry::record_job_enqueued(&request.job_type, request.priority);
        }
        Ok(ids)
    }

    async fn dequeue(&self, request: DequeueRequest) -> Result<Option<Job>, QueueError> {
        let span = telemetry::job_dequeue_span(&request.worker_id);
        async move {
            let mut tx = self.pool.begin().await?;

            let selected = sqlx::query(
                r#"
                SELECT id
                FROM skua_jobs
                WHERE status IN ('ready', 'scheduled')
                  AND run_at <= NOW()
                  AND ($1::text[] IS NULL OR job_type = ANY($1))
                ORDER BY priority DESC, run_at ASC, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
                "#,
            )
            .bind(&request.job_types)
            .fetch_optional(&mut *tx)
            .await?;

            let Some(selected) = selected else {
                drop(tx);
                return Ok(None);
            };
            let id: i64 = selected.try_get("id")?;

            let row = sqlx::query(
                r#"
                UPDATE skua_jobs
                SET status = 'processing',
                    claimed_by = $2,
                    claimed_at = NOW(),
                    updated_at = NOW()
                WHERE id = $1
                RETURNING id, job_type, payload, priority, run_at, status,
                          claimed_by, claimed_at, attempts, max_attempts,
                          last_error, created_at, updated_at, finished_at
                "#,
            )
            .bind(id)
            .bind(&request.worker_id)
            .fetch_one(&mut *tx)
            .await?;

            let job = job_from_row(&row)?;
            tx.commit().await?;

            debug!(job_id = %job.id, job_type = %job.job_type, "job claimed");
            Ok(Some(job))
        }
        .instrument(span)
        .await
    }

    async fn complete(&self, job_id: JobId) -> Result<(), QueueError> {
        self.complete_row(job_id, None).await
    }

    async fn fail(
        &self,
        job_id: JobId,
        error: &str,
        retryable: bool,
    ) -> Result<FailOutcome, QueueError> {
        self.fail_row(job_id, None, error, retryable).await
    }

    async fn complete_claim(&self, claim: &Claim) -> Result<(), QueueError> {
        self.complete_row(claim.job_id, Some(claim)).await
    }

    async fn fail_claim(
        &self,
        claim: &Claim,
        error: &str,
        retryable: bool,
    ) -> Result<FailOutcome, QueueError> {
        self.fail_row(claim.job_id, Some(claim), error, retryable)
            .await
    }

    async fn job(&self, job_id: JobId) -> Result<Option<Job>, QueueError> {
        let row = sqlx::query(
            r#"
            SELECT id, job_type, payload, priority, run_at, status,
                   claimed_by, claimed_at, attempts, max_attempts,
                   last_error, created_at, updated_at, finished_at
            FROM skua_jobs
            WHERE id = $1
            "#,
        )
        .bind(job_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(job_from_row).transpose()
    }
}

#[async_trait]
impl StaleClaimScanner for PostgresQueueStore {
    async fn requeue_stale_claims(&self, timeout: Duration) -> Result<u64, QueueError> {
        let span = telemetry::sweep_span(timeout.num_seconds());
        async move {
            let mut tx = self.pool.begin().await?;

            // Rows a live worker is reporting on right now are locked; skip them.
            let stale = sqlx::query(
                r#"
                SELECT id, attempts, max_attempts, NOW() AS now
                FROM skua_jobs
                WHERE status = 'processing'
                  AND claimed_at < NOW() - ($1::bigint) * INTERVAL '1 millisecond'
                ORDER BY claimed_at
                FOR UPDATE SKIP LOCKED
                "#,
            )
            .bind(timeout.num_milliseconds())
            .fetch_all(&mut *tx)
            .await?;

            let mut reclaimed = 0u64;
            for row in &stale {
                let locked = LockedRow {
                    id: JobId(row.try_get("id")?),
                    status: JobStatus::Processing,
                    claimed_by: None,
                    claimed_at: None,
                    attempts: row.try_get("attempts")?,
                    max_attempts: row.try_get("max_attempts")?,
                    now: row.try_get("now")?,
                };
                let decision = self
                    .apply_failure(&mut tx, &locked, CLAIM_EXPIRED, true)
                    .await?;
                debug!(job_id = %locked.id, ?decision, "stale claim reclaimed");
                reclaimed += 1;
            }

            tx.commit().await?;
            telemetry::record_stale_claims(reclaimed);
            Ok(reclaimed)
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl QueueMonitor for PostgresQueueStore {
    async fn queue_stats(&self) -> Result<Vec<QueueStats>, QueueError> {
        let rows = sqlx::query(
            r#"
            SELECT job_type,
                   COUNT(*) FILTER (WHERE status = 'ready') AS ready_count,
                   COUNT(*) FILTER (WHERE status = 'processing') AS processing_count,
                   COUNT(*) FILTER (WHERE status = 'failed') AS failed_count,
                   COUNT(*) FILTER (WHERE status = 'scheduled') AS scheduled_count,
                   COUNT(*) FILTER (WHERE status = 'completed') AS completed_count
            FROM skua_jobs
            GROUP BY job_type
            ORDER BY job_type
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(QueueStats {
                    job_type: row.try_get("job_type")?,
                    ready_count: count(row, "ready_count")?,
                    processing_count: count(row, "processing_count")?,
                    failed_count: count(row, "failed_count")?,
                    scheduled_count: count(row, "scheduled_count")?,
                    completed_count: count(row, "completed_count")?,
                })
            })
            .collect()
    }

    async fn throughput(&self, window: Duration) -> Result<Vec<Throughput>, QueueError> {
        let rows = sqlx::query(
            r#"
            WITH bounds AS (
                SELECT NOW() - ($1::bigint) * INTERVAL '1 millisecond' AS cutoff
            )
            SELECT job_type,
                   COUNT(*) FILTER (WHERE created_at > cutoff) AS enqueued,
                   COUNT(*) FILTER (WHERE status = 'completed' AND finished_at > cutoff) AS completed,
                   COUNT(*) FILTER (WHERE status = 'failed' AND finished_at > cutoff) AS failed
            FROM skua_jobs, bounds
            WHERE created_at > cutoff OR finished_at > cutoff
            GROUP BY job_type
            ORDER BY job_type
            "#,
        )
        .bind(window.num_milliseconds())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(Throughput {
                    job_type: row.try_get("job_type")?,
                    enqueued: count(row, "enqueued")?,
                    completed: count(row, "completed")?,
                    failed: count(row, "failed")?,
                })
            })
            .collect()
    }
}
