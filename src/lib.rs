#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod dead_letter;
mod error;
mod heartbeat;
mod notify;
mod queue;
mod reclaimer;
/// Row types and state enums for the dispatch tables.
pub mod schema;
/// The segment lifecycle state machine.
pub mod segment;
mod util;
mod worker;

pub use self::error::{QueueError, TransitionError};
pub use self::notify::channel_name;
pub use self::queue::{
    FailOutcome, JobQueue, NewJob, QueueConfig, DEFAULT_MAX_ATTEMPTS, DEFAULT_PRIORITY,
};
pub use self::reclaimer::Reclaimer;
pub use self::schema::{DeadLetterJob, Job, JobState, WorkerHeartbeat};
pub use self::segment::{Segment, SegmentState};
pub use self::worker::{JobHandler, Worker, WorkerConfig, WorkerHandle};

/// Run the embedded migrations, creating the `jobs`, `dead_letter_jobs`,
/// `segments`, and `worker_heartbeats` tables.
pub async fn setup_database(pool: &sqlx::PgPool) -> Result<(), QueueError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
