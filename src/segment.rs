//! Lifecycle state machine for segments, the higher-level unit of content
//! that queue jobs advance stage by stage.
//!
//! The transition table is strict: anything not listed is rejected, naming
//! the attempted `from -> to`. Validation and the write happen in one
//! transaction, so an illegal transition never partially applies even under
//! concurrent writers. This replaces the database trigger the original
//! system used with an explicit, testable function.

use crate::error::TransitionError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use tracing::{debug, instrument};

/// Pipeline state of a segment.
///
/// The happy path runs `Queued` through `Archived` in order; `Failed` is
/// reachable from every in-flight state and only leads back to `Queued`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SegmentState {
    /// Waiting for the pipeline to pick it up.
    Queued,
    /// Gathering source material.
    Retrieving,
    /// Script/content generation in progress.
    Generating,
    /// Audio rendering in progress.
    Rendering,
    /// Loudness normalization in progress.
    Normalizing,
    /// Fully produced, waiting to air.
    Ready,
    /// Currently on air.
    Airing,
    /// Finished airing.
    Aired,
    /// Retained for the archive; terminal.
    Archived,
    /// A pipeline stage failed; retryable back to `Queued`.
    Failed,
}

impl SegmentState {
    /// Lowercase database representation.
    pub fn as_str(self) -> &'static str {
        match self {
            SegmentState::Queued => "queued",
            SegmentState::Retrieving => "retrieving",
            SegmentState::Generating => "generating",
            SegmentState::Rendering => "rendering",
            SegmentState::Normalizing => "normalizing",
            SegmentState::Ready => "ready",
            SegmentState::Airing => "airing",
            SegmentState::Aired => "aired",
            SegmentState::Archived => "archived",
            SegmentState::Failed => "failed",
        }
    }

    /// Whether `self -> to` is listed in the transition table.
    pub fn allows_transition(self, to: SegmentState) -> bool {
        use SegmentState::*;
        matches!(
            (self, to),
            (Queued, Retrieving)
                | (Retrieving, Generating)
                | (Retrieving, Failed)
                | (Generating, Rendering)
                | (Generating, Failed)
                | (Rendering, Normalizing)
                | (Rendering, Failed)
                | (Normalizing, Ready)
                | (Normalizing, Failed)
                | (Ready, Airing)
                | (Airing, Aired)
                | (Aired, Archived)
                | (Failed, Queued)
        )
    }
}

impl std::fmt::Display for SegmentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row in the `segments` table.
///
/// Pipeline-stage outputs live in other tables and are opaque to this core.
#[derive(Debug, Clone, FromRow)]
pub struct Segment {
    /// Unique identifier.
    pub id: i64,
    /// Current pipeline state.
    pub state: SegmentState,
    /// `failed -> queued` retries consumed so far.
    pub retry_count: i32,
    /// Retry budget.
    pub max_retries: i32,
    /// Last pipeline error, if any.
    pub last_error: Option<String>,
    /// Insert time.
    pub created_at: DateTime<Utc>,
    /// Last transition time.
    pub updated_at: DateTime<Utc>,
}

/// Create a segment in `queued` with the given retry budget.
pub async fn create(pool: &PgPool, max_retries: i32) -> Result<Segment, TransitionError> {
    let segment = sqlx::query_as::<_, Segment>(
        "INSERT INTO segments (max_retries) VALUES ($1) RETURNING *",
    )
    .bind(max_retries)
    .fetch_one(pool)
    .await?;
    Ok(segment)
}

/// Fetch a segment by id.
pub async fn get(pool: &PgPool, segment_id: i64) -> Result<Segment, TransitionError> {
    sqlx::query_as::<_, Segment>("SELECT * FROM segments WHERE id = $1")
        .bind(segment_id)
        .fetch_optional(pool)
        .await?
        .ok_or(TransitionError::SegmentNotFound(segment_id))
}

/// Apply a state transition and return the updated segment.
///
/// `failed -> queued` additionally enforces the retry budget and increments
/// `retry_count` in the same update. The row is locked for the duration of
/// the check-and-write, so concurrent transition attempts serialize and the
/// loser is rejected against the state the winner left behind.
#[instrument(name = "dispatch.segment_transition", skip(pool), fields(to = %to))]
pub async fn transition(
    pool: &PgPool,
    segment_id: i64,
    to: SegmentState,
) -> Result<Segment, TransitionError> {
    let mut tx = pool.begin().await?;

    let current = sqlx::query_as::<_, Segment>("SELECT * FROM segments WHERE id = $1 FOR UPDATE")
        .bind(segment_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(TransitionError::SegmentNotFound(segment_id))?;

    if !current.state.allows_transition(to) {
        return Err(TransitionError::InvalidTransition {
            from: current.state,
            to,
        });
    }

    let segment = if current.state == SegmentState::Failed && to == SegmentState::Queued {
        if current.retry_count >= current.max_retries {
            return Err(TransitionError::RetryLimitExceeded {
                segment_id,
                retry_count: current.retry_count,
                max_retries: current.max_retries,
            });
        }

        sqlx::query_as::<_, Segment>(
            r"
            UPDATE segments SET
                state = $2,
                retry_count = retry_count + 1,
                last_error = NULL,
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            ",
        )
        .bind(segment_id)
        .bind(to)
        .fetch_one(&mut *tx)
        .await?
    } else {
        sqlx::query_as::<_, Segment>(
            "UPDATE segments SET state = $2, updated_at = NOW() WHERE id = $1 RETURNING *",
        )
        .bind(segment_id)
        .bind(to)
        .fetch_one(&mut *tx)
        .await?
    };

    tx.commit().await?;

    debug!(
        segment.id = segment_id,
        from = %current.state,
        "Segment transitioned"
    );
    Ok(segment)
}

/// Transition a segment to `failed` and record the error in the same update.
#[instrument(name = "dispatch.segment_mark_failed", skip(pool, error))]
pub async fn mark_failed(
    pool: &PgPool,
    segment_id: i64,
    error: &str,
) -> Result<Segment, TransitionError> {
    let mut tx = pool.begin().await?;

    let current = sqlx::query_as::<_, Segment>("SELECT * FROM segments WHERE id = $1 FOR UPDATE")
        .bind(segment_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(TransitionError::SegmentNotFound(segment_id))?;

    if !current.state.allows_transition(SegmentState::Failed) {
        return Err(TransitionError::InvalidTransition {
            from: current.state,
            to: SegmentState::Failed,
        });
    }

    let segment = sqlx::query_as::<_, Segment>(
        r"
        UPDATE segments SET
            state = 'failed',
            last_error = $2,
            updated_at = NOW()
        WHERE id = $1
        RETURNING *
        ",
    )
    .bind(segment_id)
    .bind(error)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(segment)
}
