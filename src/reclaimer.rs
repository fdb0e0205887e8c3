//! Background sweep that returns expired leases to the queue.

use crate::queue::JobQueue;
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::error;

const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Periodically runs [`JobQueue::reclaim_stale`] on its own timer,
/// independent of claim/complete traffic. Run one per process; running more
/// is safe, just redundant.
#[derive(Debug)]
pub struct Reclaimer {
    queue: JobQueue,
    interval: Duration,
}

impl Reclaimer {
    /// Create a reclaimer with the default 30s sweep interval.
    pub fn new(queue: JobQueue) -> Self {
        Self {
            queue,
            interval: DEFAULT_SWEEP_INTERVAL,
        }
    }

    /// Override the sweep interval.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Spawn the sweep loop. Aborting the returned handle stops it.
    pub fn start(self) -> AbortHandle {
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                ticker.tick().await;
                if let Err(err) = self.queue.reclaim_stale().await {
                    error!(error = %err, "Stale-lease sweep failed");
                }
            }
        });
        task.abort_handle()
    }
}
