//! Periodic liveness heartbeats, one row per worker instance.
//!
//! Observability only: a missed heartbeat never affects job processing, and
//! failures here are logged and swallowed.

use serde_json::json;
use sqlx::PgPool;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::warn;

const STATUS_RUNNING: &str = "running";
const STATUS_STOPPED: &str = "stopped";

async fn upsert(
    pool: &PgPool,
    worker_type: &str,
    instance_id: &str,
    status: &str,
    jobs_in_flight: usize,
    started: Instant,
) -> Result<(), sqlx::Error> {
    let metrics = json!({
        "jobs_in_flight": jobs_in_flight,
        "uptime_secs": started.elapsed().as_secs(),
    });

    sqlx::query(
        r"
        INSERT INTO worker_heartbeats (worker_type, instance_id, status, last_heartbeat, metrics)
        VALUES ($1, $2, $3, NOW(), $4)
        ON CONFLICT (worker_type, instance_id)
        DO UPDATE SET status = $3, last_heartbeat = NOW(), metrics = $4
        ",
    )
    .bind(worker_type)
    .bind(instance_id)
    .bind(status)
    .bind(metrics)
    .execute(pool)
    .await?;
    Ok(())
}

pub(crate) struct HeartbeatHandle {
    task: JoinHandle<()>,
    pool: PgPool,
    worker_type: String,
    instance_id: String,
    in_flight: Arc<AtomicUsize>,
    started: Instant,
}

impl std::fmt::Debug for HeartbeatHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatHandle")
            .field("worker_type", &self.worker_type)
            .field("instance_id", &self.instance_id)
            .finish()
    }
}

impl HeartbeatHandle {
    /// Stop the periodic task and record a final `stopped` heartbeat.
    pub(crate) async fn stop(self) {
        self.task.abort();
        // Wait out the cancellation so a racing periodic upsert cannot land
        // after the final one.
        let _ = self.task.await;
        let result = upsert(
            &self.pool,
            &self.worker_type,
            &self.instance_id,
            STATUS_STOPPED,
            self.in_flight.load(Ordering::SeqCst),
            self.started,
        )
        .await;
        if let Err(error) = result {
            warn!(%error, "Failed to write final heartbeat");
        }
    }
}

/// Start the heartbeat task: an immediate upsert, then one per interval.
pub(crate) fn spawn(
    pool: PgPool,
    worker_type: String,
    instance_id: String,
    interval: Duration,
    in_flight: Arc<AtomicUsize>,
) -> HeartbeatHandle {
    let started = Instant::now();

    let task = {
        let pool = pool.clone();
        let worker_type = worker_type.clone();
        let instance_id = instance_id.clone();
        let in_flight = in_flight.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let result = upsert(
                    &pool,
                    &worker_type,
                    &instance_id,
                    STATUS_RUNNING,
                    in_flight.load(Ordering::SeqCst),
                    started,
                )
                .await;
                if let Err(error) = result {
                    warn!(%error, "Failed to write heartbeat");
                }
            }
        })
    };

    HeartbeatHandle {
        task,
        pool,
        worker_type,
        instance_id,
        in_flight,
        started,
    }
}
