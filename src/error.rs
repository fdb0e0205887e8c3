use crate::segment::SegmentState;

/// Errors returned by the job queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The requested priority is outside the accepted `1..=10` range.
    #[error("invalid job priority {0}, must be between 1 and 10")]
    InvalidPriority(i32),

    /// No job exists with the given id.
    #[error("job {0} not found")]
    JobNotFound(i64),

    /// No dead-letter entry exists with the given id.
    #[error("dead-letter entry {0} not found")]
    DeadLetterNotFound(i64),

    /// The underlying database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Running the embedded migrations failed.
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Errors returned when applying a segment state transition.
#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    /// The transition is not listed in the pipeline's transition table.
    #[error("invalid segment transition {from} -> {to}")]
    InvalidTransition {
        /// State the segment was in when the transition was attempted.
        from: SegmentState,
        /// State the caller asked for.
        to: SegmentState,
    },

    /// A `failed -> queued` retry was attempted with no retry budget left.
    #[error("segment {segment_id} exhausted its retries ({retry_count}/{max_retries})")]
    RetryLimitExceeded {
        /// Segment the retry was attempted on.
        segment_id: i64,
        /// Retries already consumed.
        retry_count: i32,
        /// Configured retry budget.
        max_retries: i32,
    },

    /// No segment exists with the given id.
    #[error("segment {0} not found")]
    SegmentNotFound(i64),

    /// The underlying database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
