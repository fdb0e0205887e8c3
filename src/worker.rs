//! The reusable worker loop: claim jobs of one type, run a caller-supplied
//! handler with bounded concurrency, and report the outcome back to the
//! queue. Every pipeline stage runs one of these.

use crate::heartbeat;
use crate::notify::Wakeup;
use crate::queue::{FailOutcome, JobQueue};
use crate::schema::Job;
use crate::util::panic_message;
use futures_util::FutureExt;
use rand::Rng;
use serde_json::json;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

const DEFAULT_LEASE: Duration = Duration::from_secs(10 * 60);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_JITTER: Duration = Duration::from_millis(250);
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// A job handler, supplied by the pipeline stage that owns the worker.
///
/// Execution is at-least-once: a lease that expires just before completion
/// is recorded lets another worker re-run the job, so handlers must be
/// idempotent (or deduplicate through their own keys) to be exactly-once in
/// effect.
pub trait JobHandler: Send + Sync + 'static {
    /// Application data available to every handled job.
    type Context: Clone + Send + Sync + 'static;

    /// Execute one job. An `Err` (or a panic) records a failed attempt and
    /// schedules the retry/dead-letter path.
    fn handle(
        &self,
        job: Job,
        ctx: Self::Context,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// Configuration for one worker instance.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    worker_type: String,
    instance_id: String,
    max_concurrent_jobs: usize,
    lease: Duration,
    poll_interval: Duration,
    jitter: Duration,
    heartbeat_interval: Duration,
    shutdown_timeout: Duration,
}

impl WorkerConfig {
    /// Configure a worker claiming jobs of type `worker_type`, identified as
    /// `instance_id` in leases and heartbeats.
    pub fn new(worker_type: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            worker_type: worker_type.into(),
            instance_id: instance_id.into(),
            max_concurrent_jobs: 1,
            lease: DEFAULT_LEASE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter: DEFAULT_JITTER,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    /// Cap on jobs in flight at once.
    pub fn max_concurrent_jobs(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max.max(1);
        self
    }

    /// Lease duration stamped on every claim. Handlers are expected to
    /// finish (or self-limit) within it.
    pub fn lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// How often to poll when no wake notification arrives.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Maximum random addition to the poll interval, to spread out herds of
    /// idle workers.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// How often to upsert the liveness heartbeat.
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// How long `shutdown` waits for in-flight jobs to drain.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    fn worker_id(&self) -> String {
        format!("{}-{}", self.worker_type, self.instance_id)
    }
}

/// A worker instance: owns its config, queue handle, handler, and context.
///
/// Everything is explicit so many instances can run in one process (tests do
/// exactly that).
pub struct Worker<H: JobHandler> {
    queue: JobQueue,
    config: WorkerConfig,
    handler: Arc<H>,
    context: H::Context,
}

impl<H: JobHandler> Worker<H> {
    /// Create a worker. No background work starts until [`Worker::start`].
    pub fn new(queue: JobQueue, config: WorkerConfig, handler: H, context: H::Context) -> Self {
        Self {
            queue,
            config,
            handler: Arc::new(handler),
            context,
        }
    }

    /// Spawn the claim loop and heartbeat task.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let in_flight = Arc::new(AtomicUsize::new(0));

        let heartbeat = heartbeat::spawn(
            self.queue.pool().clone(),
            self.config.worker_type.clone(),
            self.config.instance_id.clone(),
            self.config.heartbeat_interval,
            in_flight.clone(),
        );

        info!(
            worker.kind = %self.config.worker_type,
            worker.instance = %self.config.instance_id,
            max_concurrent_jobs = self.config.max_concurrent_jobs,
            "Starting worker"
        );

        let span = info_span!("worker", worker.id = %self.config.worker_id());
        let loop_in_flight = in_flight.clone();
        let join = tokio::spawn(self.run(shutdown_rx, loop_in_flight).instrument(span));

        WorkerHandle {
            shutdown_tx,
            join,
            heartbeat,
            in_flight,
        }
    }

    async fn run(self, mut shutdown_rx: watch::Receiver<bool>, in_flight: Arc<AtomicUsize>) {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_jobs));
        let mut wakeup = Wakeup::subscribe(self.queue.pool(), &self.config.worker_type).await;
        let worker_id = self.config.worker_id();

        loop {
            // Reserve a dispatch slot before claiming, so a claimed job is
            // never left waiting for capacity.
            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown_rx.changed() => break,
            };

            match self
                .queue
                .claim(&self.config.worker_type, &worker_id, self.config.lease)
                .await
            {
                Ok(Some(job)) => {
                    self.dispatch(job, permit, &in_flight);
                    // Tight loop: there may be more eligible work right now.
                }
                Ok(None) => {
                    drop(permit);
                    trace!("No eligible jobs, waiting");
                    tokio::select! {
                        () = sleep(self.sleep_duration_with_jitter()) => {}
                        () = wakeup.wait() => {}
                        _ = shutdown_rx.changed() => break,
                    }
                }
                Err(error) => {
                    drop(permit);
                    error!(%error, "Failed to claim a job");
                    tokio::select! {
                        () = sleep(self.sleep_duration_with_jitter()) => {}
                        _ = shutdown_rx.changed() => break,
                    }
                }
            }
        }

        debug!("Worker stopped claiming, draining in-flight jobs");
        let max = u32::try_from(self.config.max_concurrent_jobs).unwrap_or(u32::MAX);
        if timeout(self.config.shutdown_timeout, semaphore.acquire_many(max))
            .await
            .is_err()
        {
            warn!(
                in_flight = in_flight.load(Ordering::SeqCst),
                "Shutdown timeout elapsed with jobs still in flight; their leases will expire"
            );
        }
    }

    /// Run one claimed job on its own task. The permit rides along and is
    /// released once the job's outcome has been recorded.
    fn dispatch(&self, job: Job, permit: OwnedSemaphorePermit, in_flight: &Arc<AtomicUsize>) {
        let queue = self.queue.clone();
        let handler = self.handler.clone();
        let context = self.context.clone();
        let in_flight = in_flight.clone();

        let span = info_span!("job", job.id = %job.id, job.kind = %job.job_type);
        in_flight.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(
            async move {
                let job_id = job.id;
                debug!(job.attempts = job.attempts, "Running job");

                let result = AssertUnwindSafe(handler.handle(job, context))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| Err(panic_message(&*panic)));

                match result {
                    Ok(()) => match queue.complete(job_id).await {
                        Ok(true) => debug!("Job completed"),
                        Ok(false) => warn!(
                            "Job was no longer processing at completion; its lease expired and it was reclaimed"
                        ),
                        Err(error) => error!(%error, "Failed to record job completion"),
                    },
                    Err(job_error) => {
                        warn!(error = %job_error, "Job handler failed");
                        let details = json!({
                            "chain": job_error.chain().map(|e| e.to_string()).collect::<Vec<_>>(),
                        });
                        match queue.fail(job_id, &job_error.to_string(), Some(details)).await {
                            Ok(FailOutcome::Retried) => debug!("Job scheduled for retry"),
                            Ok(FailOutcome::DeadLettered) => warn!("Job moved to dead letter"),
                            Err(error) => error!(%error, "Failed to record job failure"),
                        }
                    }
                }

                in_flight.fetch_sub(1, Ordering::SeqCst);
                drop(permit);
            }
            .instrument(span),
        );
    }

    fn sleep_duration_with_jitter(&self) -> Duration {
        if self.config.jitter.is_zero() {
            return self.config.poll_interval;
        }

        let jitter_millis = u64::try_from(self.config.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.config.poll_interval + Duration::from_millis(random_jitter)
    }
}

/// Handle to a started worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
    heartbeat: heartbeat::HeartbeatHandle,
    in_flight: Arc<AtomicUsize>,
}

impl WorkerHandle {
    /// Jobs currently being handled by this worker.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Stop claiming, wait for in-flight jobs to drain (bounded by the
    /// configured shutdown timeout), and write a final `stopped` heartbeat.
    ///
    /// Jobs still in flight when the timeout elapses keep running detached;
    /// their leases expire and the reclaimer returns them to `pending`.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(error) = self.join.await {
            warn!(%error, "Worker task panicked");
        }
        self.heartbeat.stop().await;
    }
}
