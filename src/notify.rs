//! Advisory wake channel on Postgres LISTEN/NOTIFY.
//!
//! Purely a latency optimization: workers poll on a fixed interval as the
//! liveness floor, and a notification only shortens the wait. Subscribers
//! must still call `claim` — the notification payload is informational and
//! another worker may already hold the job.

use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tracing::{trace, warn};

/// Channel name for a job type: `new_job_<type>`.
pub fn channel_name(job_type: &str) -> String {
    format!("new_job_{job_type}")
}

/// Publish a wake signal for a freshly enqueued job. Best-effort.
pub(crate) async fn wake(pool: &PgPool, job_type: &str, job_id: i64) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(channel_name(job_type))
        .bind(job_id.to_string())
        .execute(pool)
        .await?;
    Ok(())
}

/// Subscription to one job type's wake channel.
///
/// Degrades to "never wakes" when the listener cannot be established; the
/// worker's poll interval covers liveness in that case.
pub(crate) struct Wakeup {
    listener: Option<PgListener>,
}

impl Wakeup {
    pub(crate) async fn subscribe(pool: &PgPool, job_type: &str) -> Self {
        let channel = channel_name(job_type);
        match PgListener::connect_with(pool).await {
            Ok(mut listener) => match listener.listen(&channel).await {
                Ok(()) => Self {
                    listener: Some(listener),
                },
                Err(error) => {
                    warn!(%error, channel, "Failed to listen on wake channel");
                    Self { listener: None }
                }
            },
            Err(error) => {
                warn!(%error, channel, "Failed to connect wake listener");
                Self { listener: None }
            }
        }
    }

    /// Resolve on the next wake signal; pends forever without a listener.
    pub(crate) async fn wait(&mut self) {
        let Some(listener) = self.listener.as_mut() else {
            return std::future::pending().await;
        };

        match listener.recv().await {
            Ok(notification) => {
                trace!(payload = notification.payload(), "Woken by notification");
            }
            Err(error) => {
                // Drop the listener rather than spin on a broken connection;
                // the poll floor keeps the worker live.
                warn!(%error, "Wake listener error, falling back to polling");
                self.listener = None;
            }
        }
    }
}
