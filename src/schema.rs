//! Row types and state enums backing the dispatch tables.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

/// Queue-level state of a job.
///
/// `Failed` is transient: `fail` either reschedules the job back to
/// `Pending` or deletes it into the dead-letter table, so a job is never
/// left standing in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Eligible (or scheduled) for claiming.
    Pending,
    /// Claimed under a live lease.
    Processing,
    /// Finished successfully; terminal.
    Completed,
    /// Transient marker between a failure and its retry/dead-letter outcome.
    Failed,
}

impl JobState {
    /// Lowercase database representation.
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row in the `jobs` table.
#[derive(Debug, Clone, FromRow)]
pub struct Job {
    /// Unique identifier, assigned on enqueue.
    pub id: i64,
    /// Tag selecting which worker handles this job.
    pub job_type: String,
    /// Opaque JSON document, interpreted only by the consuming worker.
    pub payload: Value,
    /// Current queue state.
    pub state: JobState,
    /// 1..=10, higher is served first.
    pub priority: i32,
    /// The job is not claimable before this time.
    pub scheduled_for: DateTime<Utc>,
    /// Lease expiry; `None` while unclaimed.
    pub locked_until: Option<DateTime<Utc>>,
    /// Lease holder; `None` while unclaimed.
    pub locked_by: Option<String>,
    /// Claims made so far; incremented by each claim.
    pub attempts: i32,
    /// Attempt budget before the job is dead-lettered.
    pub max_attempts: i32,
    /// Last failure reason, if any.
    pub error: Option<String>,
    /// Structured context for the last failure, if any.
    pub error_details: Option<Value>,
    /// First time the job was claimed.
    pub started_at: Option<DateTime<Utc>>,
    /// Time the job reached `completed`.
    pub completed_at: Option<DateTime<Utc>>,
    /// Insert time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

/// A row in the `dead_letter_jobs` table.
///
/// Created exactly once per job that exhausts its retries; the source `jobs`
/// row is deleted in the same transaction.
#[derive(Debug, Clone, FromRow)]
pub struct DeadLetterJob {
    /// Identifier of the dead-letter entry itself.
    pub id: i64,
    /// Id the job carried while it was queued.
    pub original_job_id: i64,
    /// Job type of the original job.
    pub job_type: String,
    /// Payload of the original job, preserved for triage.
    pub payload: Value,
    /// Reason recorded by the final `fail` call.
    pub failure_reason: String,
    /// Structured context recorded by the final `fail` call.
    pub failure_details: Option<Value>,
    /// Attempts consumed before giving up.
    pub attempts_made: i32,
    /// When an operator reviewed this entry, if ever.
    pub reviewed_at: Option<DateTime<Utc>>,
    /// Operator resolution (`retried`, `dismissed`, free text).
    pub resolution: Option<String>,
    /// When the job was dead-lettered.
    pub created_at: DateTime<Utc>,
}

/// A row in the `worker_heartbeats` table. Observability only.
#[derive(Debug, Clone, FromRow)]
pub struct WorkerHeartbeat {
    /// Worker type, i.e. the job type this worker claims.
    pub worker_type: String,
    /// Identity of the worker instance within its type.
    pub instance_id: String,
    /// `running` while live, `stopped` after a graceful shutdown.
    pub status: String,
    /// Time of the last upsert.
    pub last_heartbeat: DateTime<Utc>,
    /// Free-form instance metrics (`jobs_in_flight`, `uptime_secs`).
    pub metrics: Value,
}
