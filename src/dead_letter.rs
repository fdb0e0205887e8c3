//! Triage surface for the dead-letter table.
//!
//! Entries are created by [`JobQueue::fail`](crate::JobQueue::fail) when a
//! job exhausts its attempts; everything here is read or operator action.
//! Resolving an entry is a one-shot: once `reviewed_at` is set, further
//! requeue/dismiss calls are no-ops.

use crate::error::QueueError;
use crate::notify;
use crate::queue::JobQueue;
use crate::schema::DeadLetterJob;
use sqlx::PgPool;
use tracing::{info, instrument, warn};

const RESOLUTION_RETRIED: &str = "retried";

/// List dead-letter entries, newest first.
pub async fn list(
    pool: &PgPool,
    unreviewed_only: bool,
    limit: i64,
) -> Result<Vec<DeadLetterJob>, QueueError> {
    let query = if unreviewed_only {
        r"
        SELECT * FROM dead_letter_jobs
        WHERE reviewed_at IS NULL
        ORDER BY created_at DESC
        LIMIT $1
        "
    } else {
        "SELECT * FROM dead_letter_jobs ORDER BY created_at DESC LIMIT $1"
    };

    let entries = sqlx::query_as::<_, DeadLetterJob>(query)
        .bind(limit)
        .fetch_all(pool)
        .await?;
    Ok(entries)
}

/// Number of dead-letter entries awaiting review.
pub async fn unreviewed_count(pool: &PgPool) -> Result<i64, QueueError> {
    let count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM dead_letter_jobs WHERE reviewed_at IS NULL",
    )
    .fetch_one(pool)
    .await?;
    Ok(count)
}

/// Fetch one entry by id.
pub async fn get(pool: &PgPool, dead_letter_id: i64) -> Result<DeadLetterJob, QueueError> {
    sqlx::query_as::<_, DeadLetterJob>("SELECT * FROM dead_letter_jobs WHERE id = $1")
        .bind(dead_letter_id)
        .fetch_optional(pool)
        .await?
        .ok_or(QueueError::DeadLetterNotFound(dead_letter_id))
}

/// Re-enqueue a dead-lettered job with a fresh attempt budget.
///
/// Returns the new job id, or `None` if the entry was already reviewed.
/// The review stamp and the new job are written in one transaction, with
/// the stamp first acting as the gate: of any number of concurrent requeue
/// calls exactly one enqueues, and the rest return `None`.
#[instrument(name = "dispatch.dead_letter_requeue", skip(queue))]
pub async fn requeue(queue: &JobQueue, dead_letter_id: i64) -> Result<Option<i64>, QueueError> {
    let mut tx = queue.pool().begin().await?;

    let entry = sqlx::query_as::<_, DeadLetterJob>(
        r"
        UPDATE dead_letter_jobs
        SET reviewed_at = NOW(), resolution = $2
        WHERE id = $1 AND reviewed_at IS NULL
        RETURNING *
        ",
    )
    .bind(dead_letter_id)
    .bind(RESOLUTION_RETRIED)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(entry) = entry else {
        tx.rollback().await?;
        // Unknown ids are an error; an already-reviewed entry is `None`.
        get(queue.pool(), dead_letter_id).await?;
        return Ok(None);
    };

    let job_id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO jobs (job_type, payload) VALUES ($1, $2) RETURNING id",
    )
    .bind(&entry.job_type)
    .bind(&entry.payload)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;

    if let Err(error) = notify::wake(queue.pool(), &entry.job_type, job_id).await {
        warn!(%error, "Failed to send wake notification");
    }

    info!(
        dead_letter.id = dead_letter_id,
        job.id = job_id,
        "Dead-lettered job requeued"
    );
    Ok(Some(job_id))
}

/// Mark an entry as reviewed with the given resolution, without retrying.
///
/// Returns `false` if the entry was already reviewed.
#[instrument(name = "dispatch.dead_letter_dismiss", skip(pool, resolution))]
pub async fn dismiss(
    pool: &PgPool,
    dead_letter_id: i64,
    resolution: &str,
) -> Result<bool, QueueError> {
    // Existence check first so unknown ids surface as NotFound, not `false`.
    get(pool, dead_letter_id).await?;

    let result = sqlx::query(
        r"
        UPDATE dead_letter_jobs
        SET reviewed_at = NOW(), resolution = $2
        WHERE id = $1 AND reviewed_at IS NULL
        ",
    )
    .bind(dead_letter_id)
    .bind(resolution)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}
