//! The Job Queue Core: enqueue, claim, complete, fail, and the stale-lease
//! sweep. All invariants around job state and leases live here; no other
//! code path writes the `state` or lease columns.

use crate::error::QueueError;
use crate::notify;
use crate::schema::Job;
use serde_json::Value;
use sqlx::PgPool;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Default retry budget for newly enqueued jobs.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

/// Default priority for newly enqueued jobs.
pub const DEFAULT_PRIORITY: i32 = 5;

const DEFAULT_BASE_RETRY_DELAY: Duration = Duration::from_secs(5 * 60);
const MAX_BACKOFF_EXPONENT: i32 = 16;

/// Tunables for the queue. The defaults match production.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Delay before the first retry; doubles with every further failure.
    pub base_retry_delay: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            base_retry_delay: DEFAULT_BASE_RETRY_DELAY,
        }
    }
}

/// A job to be enqueued, built with defaults and overridden per field.
#[derive(Debug, Clone)]
pub struct NewJob {
    job_type: String,
    payload: Value,
    priority: i32,
    delay: Duration,
    max_attempts: i32,
}

impl NewJob {
    /// Start building a job of the given type with the given payload.
    pub fn new(job_type: impl Into<String>, payload: Value) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
            priority: DEFAULT_PRIORITY,
            delay: Duration::ZERO,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Set the priority (1..=10, higher is served first).
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Delay the job's eligibility by the given duration.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Override the attempt budget.
    pub fn max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

/// Outcome of a [`JobQueue::fail`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// The job went back to `pending` with a backoff delay.
    Retried,
    /// The job exhausted its attempts and was moved to the dead-letter table.
    DeadLettered,
}

/// Handle to the job queue. Cheap to clone; all state lives in Postgres.
#[derive(Debug, Clone)]
pub struct JobQueue {
    pool: PgPool,
    config: QueueConfig,
}

impl JobQueue {
    /// Create a queue handle with the default configuration.
    pub fn new(pool: PgPool) -> Self {
        Self::with_config(pool, QueueConfig::default())
    }

    /// Create a queue handle with an explicit configuration.
    pub fn with_config(pool: PgPool, config: QueueConfig) -> Self {
        Self { pool, config }
    }

    /// The connection pool this queue operates on.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert a `pending` job and return its id.
    ///
    /// Jobs with no delay additionally fire an advisory `new_job_<type>`
    /// notification so idle workers wake before their next poll tick.
    /// Notification delivery is best-effort; enqueue never fails on it.
    #[instrument(name = "dispatch.enqueue", skip(self, job), fields(job_type = %job.job_type))]
    pub async fn enqueue(&self, job: NewJob) -> Result<i64, QueueError> {
        validate_priority(job.priority)?;

        let id = sqlx::query_scalar::<_, i64>(
            r"
            INSERT INTO jobs (job_type, payload, priority, scheduled_for, max_attempts)
            VALUES ($1, $2, $3, NOW() + make_interval(secs => $4), $5)
            RETURNING id
            ",
        )
        .bind(&job.job_type)
        .bind(&job.payload)
        .bind(job.priority)
        .bind(job.delay.as_secs_f64())
        .bind(job.max_attempts)
        .fetch_one(&self.pool)
        .await?;

        debug!(job.id = id, "Enqueued job");

        if job.delay.is_zero() {
            if let Err(error) = notify::wake(&self.pool, &job.job_type, id).await {
                warn!(%error, "Failed to send wake notification");
            }
        }

        Ok(id)
    }

    /// Claim the best eligible job of the given type, or `None`.
    ///
    /// One statement selects the highest-priority, oldest eligible row with
    /// `FOR UPDATE SKIP LOCKED` and stamps the lease, so concurrent claimers
    /// neither block each other nor return the same job. Claiming increments
    /// `attempts`.
    #[instrument(name = "dispatch.claim", skip(self, lease))]
    pub async fn claim(
        &self,
        job_type: &str,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<Job>, QueueError> {
        let job = sqlx::query_as::<_, Job>(
            r"
            UPDATE jobs SET
                state = 'processing',
                locked_by = $2,
                locked_until = NOW() + make_interval(secs => $3),
                attempts = jobs.attempts + 1,
                started_at = COALESCE(jobs.started_at, NOW()),
                updated_at = NOW()
            FROM (
                SELECT id FROM jobs
                WHERE job_type = $1
                  AND state = 'pending'
                  AND scheduled_for <= NOW()
                  AND (locked_until IS NULL OR locked_until < NOW())
                  AND attempts < max_attempts
                ORDER BY priority DESC, created_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            ) next
            WHERE jobs.id = next.id
            RETURNING jobs.*
            ",
        )
        .bind(job_type)
        .bind(worker_id)
        .bind(lease.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(job) = &job {
            debug!(job.id = job.id, job.attempts = job.attempts, "Claimed job");
        }

        Ok(job)
    }

    /// Mark a `processing` job as completed.
    ///
    /// Returns `false` without touching the row when the job is not in
    /// `processing` — a worker whose lease expired and whose job was
    /// reclaimed must not overwrite someone else's outcome.
    #[instrument(name = "dispatch.complete", skip(self))]
    pub async fn complete(&self, job_id: i64) -> Result<bool, QueueError> {
        let result = sqlx::query(
            r"
            UPDATE jobs SET
                state = 'completed',
                locked_by = NULL,
                locked_until = NULL,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND state = 'processing'
            ",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Record a failed execution.
    ///
    /// If attempts remain, the job goes back to `pending` with
    /// `scheduled_for` pushed out by an exponentially growing backoff.
    /// Otherwise the job is moved to the dead-letter table and its `jobs`
    /// row deleted, in one transaction.
    #[instrument(name = "dispatch.fail", skip(self, details))]
    pub async fn fail(
        &self,
        job_id: i64,
        error: &str,
        details: Option<Value>,
    ) -> Result<FailOutcome, QueueError> {
        let mut tx = self.pool.begin().await?;

        let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1 FOR UPDATE")
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(QueueError::JobNotFound(job_id))?;

        if job.attempts >= job.max_attempts {
            sqlx::query(
                r"
                INSERT INTO dead_letter_jobs
                    (original_job_id, job_type, payload, failure_reason, failure_details, attempts_made)
                VALUES ($1, $2, $3, $4, $5, $6)
                ",
            )
            .bind(job.id)
            .bind(&job.job_type)
            .bind(&job.payload)
            .bind(error)
            .bind(&details)
            .bind(job.attempts)
            .execute(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM jobs WHERE id = $1")
                .bind(job_id)
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;

            warn!(
                job.id = job_id,
                job.attempts = job.attempts,
                "Job exhausted its attempts, moved to dead letter"
            );
            return Ok(FailOutcome::DeadLettered);
        }

        let backoff = backoff_secs(self.config.base_retry_delay, job.attempts);
        sqlx::query(
            r"
            UPDATE jobs SET
                state = 'pending',
                locked_by = NULL,
                locked_until = NULL,
                error = $2,
                error_details = $3,
                scheduled_for = NOW() + make_interval(secs => $4),
                updated_at = NOW()
            WHERE id = $1
            ",
        )
        .bind(job_id)
        .bind(error)
        .bind(&details)
        .bind(backoff)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(
            job.id = job_id,
            job.attempts = job.attempts,
            backoff_secs = backoff,
            "Job rescheduled for retry"
        );
        Ok(FailOutcome::Retried)
    }

    /// Recover `processing` jobs whose lease expired.
    ///
    /// Rows with attempts remaining go back to `pending`; rows whose worker
    /// crashed on the final allowed attempt have no retry left for a claim
    /// to consume, so they take the dead-letter move directly. Either way no
    /// job is left stranded. This is the sole recovery path for workers that
    /// crashed mid-job; it is idempotent and safe to run concurrently with
    /// claims. Returns the number of jobs returned to `pending`.
    #[instrument(name = "dispatch.reclaim_stale", skip(self))]
    pub async fn reclaim_stale(&self) -> Result<u64, QueueError> {
        let mut tx = self.pool.begin().await?;

        let dead = sqlx::query(
            r"
            WITH expired AS (
                SELECT id, job_type, payload, locked_by, locked_until, attempts
                FROM jobs
                WHERE state = 'processing' AND locked_until < NOW() AND attempts >= max_attempts
                FOR UPDATE SKIP LOCKED
            ),
            moved AS (
                INSERT INTO dead_letter_jobs
                    (original_job_id, job_type, payload, failure_reason, failure_details, attempts_made)
                SELECT id, job_type, payload,
                       'lease expired with no attempts remaining',
                       jsonb_build_object('locked_by', locked_by, 'locked_until', locked_until),
                       attempts
                FROM expired
            )
            DELETE FROM jobs WHERE id IN (SELECT id FROM expired)
            ",
        )
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query(
            r"
            UPDATE jobs SET
                state = 'pending',
                locked_by = NULL,
                locked_until = NULL,
                updated_at = NOW()
            WHERE state = 'processing' AND locked_until < NOW()
            ",
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let reclaimed = result.rows_affected();
        if reclaimed > 0 {
            warn!(reclaimed, "Reset jobs with expired leases");
        }
        if dead.rows_affected() > 0 {
            warn!(
                dead_lettered = dead.rows_affected(),
                "Expired leases had no attempts remaining, moved to dead letter"
            );
        }
        Ok(reclaimed)
    }

    /// Number of `pending` jobs, across all types.
    pub async fn pending_count(&self) -> Result<i64, QueueError> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM jobs WHERE state = 'pending'")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Number of jobs currently held under a lease.
    pub async fn processing_count(&self) -> Result<i64, QueueError> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM jobs WHERE state = 'processing'")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Fetch a job by id.
    pub async fn get(&self, job_id: i64) -> Result<Job, QueueError> {
        sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(QueueError::JobNotFound(job_id))
    }
}

fn validate_priority(priority: i32) -> Result<(), QueueError> {
    if (1..=10).contains(&priority) {
        Ok(())
    } else {
        Err(QueueError::InvalidPriority(priority))
    }
}

/// Backoff before the retry following the `attempts`-th failed attempt:
/// `base * 2^(attempts - 1)`, so the first retry waits one base delay.
fn backoff_secs(base: Duration, attempts: i32) -> f64 {
    let exponent = attempts.saturating_sub(1).clamp(0, MAX_BACKOFF_EXPONENT);
    base.as_secs_f64() * 2f64.powi(exponent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::{assert_err, assert_ok};

    #[test]
    fn backoff_doubles_from_base_delay() {
        let base = Duration::from_secs(300);
        assert_eq!(backoff_secs(base, 1), 300.0);
        assert_eq!(backoff_secs(base, 2), 600.0);
        assert_eq!(backoff_secs(base, 3), 1200.0);
        assert_eq!(backoff_secs(base, 4), 2400.0);
    }

    #[test]
    fn backoff_handles_degenerate_attempt_counts() {
        let base = Duration::from_secs(300);
        assert_eq!(backoff_secs(base, 0), 300.0);
        // Clamped exponent keeps the interval finite.
        assert_eq!(backoff_secs(base, i32::MAX), 300.0 * 65536.0);
    }

    #[test]
    fn priority_must_be_within_range() {
        assert_ok!(validate_priority(1));
        assert_ok!(validate_priority(5));
        assert_ok!(validate_priority(10));
        assert_err!(validate_priority(0));
        assert_err!(validate_priority(11));
        assert_err!(validate_priority(-3));
    }

    #[test]
    fn new_job_defaults() {
        let job = NewJob::new("segment_make", serde_json::json!({}));
        assert_eq!(job.priority, DEFAULT_PRIORITY);
        assert_eq!(job.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(job.delay, Duration::ZERO);
    }
}
