//! Worker pool that drives handlers from the queue.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::{FailOutcome, Job, JobQueue, QueueError};

type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;
type HookFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Type alias for a job handler. `Err` asks the queue to retry.
pub type JobHandler = Arc<dyn Fn(Job) -> HandlerFuture + Send + Sync>;

/// Type alias for the hook invoked on every dead-lettered job.
pub type DeadLetterHook = Arc<dyn Fn(Job) -> HookFuture + Send + Sync>;

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Concurrent workers.
    pub workers: usize,
    /// Minimum sleep between polls of an idle queue.
    pub min_sleep: Duration,
    /// Maximum sleep between polls of an idle queue.
    pub max_sleep: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            min_sleep: Duration::from_millis(250),
            max_sleep: Duration::from_secs(5),
        }
    }
}

/// What a single poll did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The handler succeeded and the job was acknowledged.
    Completed,
    /// The handler failed and the job was requeued.
    Retrying,
    /// The handler failed on the final attempt.
    Dead,
    /// The lease passed to another worker before the result was reported.
    LeaseLost,
}

/// Pool of workers consuming one queue.
pub struct WorkerPool {
    queue: Arc<JobQueue>,
    handlers: HashMap<String, JobHandler>,
    dead_letter: Option<DeadLetterHook>,
    config: PoolConfig,
}

impl WorkerPool {
    pub fn new(queue: Arc<JobQueue>, config: PoolConfig) -> Self {
        Self {
            queue,
            handlers: HashMap::new(),
            dead_letter: None,
            config,
        }
    }

    /// Register the handler for jobs of `kind`.
    pub fn on_job<F, Fut>(&mut self, kind: impl Into<String>, handler: F)
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        let wrapped: JobHandler = Arc::new(move |job: Job| -> HandlerFuture { Box::pin(handler(job)) });
        self.handlers.insert(kind.into(), wrapped);
    }

    /// Register the hook for dead-lettered jobs.
    pub fn on_dead_letter<F, Fut>(&mut self, hook: F)
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let wrapped: DeadLetterHook = Arc::new(move |job: Job| -> HookFuture { Box::pin(hook(job)) });
        self.dead_letter = Some(wrapped);
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// Claim and run at most one job.
    ///
    /// Returns `None` when nothing was due.
    #[tracing::instrument(skip(self))]
    pub async fn run_once(&self, worker: &str) -> Result<Option<RunOutcome>, QueueError> {
        for job in self.queue.reap_expired(Utc::now())? {
            self.dead_lettered(job).await;
        }

        let Some(job) = self.queue.claim(worker, Utc::now())? else {
            return Ok(None);
        };
        let job_id = job.id.clone();

        let result = match self.handlers.get(&job.kind) {
            Some(handler) => handler(job).await,
            None => Err(format!("no handler registered for job kind '{}'", job.kind)),
        };

        let outcome = match result {
            Ok(()) => {
                if self.queue.complete(&job_id, worker, Utc::now())? {
                    RunOutcome::Completed
                } else {
                    warn!(job_id = %job_id, "lease lost before acknowledgement");
                    RunOutcome::LeaseLost
                }
            }
            Err(err) => match self.queue.fail(&job_id, worker, &err, Utc::now())? {
                FailOutcome::Retrying { .. } => RunOutcome::Retrying,
                FailOutcome::Dead(job) => {
                    self.dead_lettered(job).await;
                    RunOutcome::Dead
                }
                FailOutcome::LeaseLost => {
                    warn!(job_id = %job_id, error = %err, "lease lost before failure was reported");
                    RunOutcome::LeaseLost
                }
            },
        };
        Ok(Some(outcome))
    }

    /// Run jobs until none is due. Returns how many ran.
    pub async fn drain(&self, worker: &str) -> Result<usize, QueueError> {
        let mut ran = 0;
        while self.run_once(worker).await?.is_some() {
            ran += 1;
        }
        Ok(ran)
    }

    /// Run the pool until shutdown is signalled.
    pub async fn run(self: Arc<Self>, shutdown_rx: watch::Receiver<bool>) {
        info!(workers = self.config.workers, "worker pool starting");

        let mut tasks = Vec::with_capacity(self.config.workers);
        for n in 0..self.config.workers.max(1) {
            let pool = Arc::clone(&self);
            let shutdown_rx = shutdown_rx.clone();
            let worker = format!("{}-{}", std::process::id(), n);
            tasks.push(tokio::spawn(async move {
                pool.worker_loop(worker, shutdown_rx).await;
            }));
        }

        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "worker task panicked");
            }
        }

        info!("worker pool shut down gracefully");
    }

    async fn worker_loop(&self, worker: String, mut shutdown_rx: watch::Receiver<bool>) {
        debug!(worker = %worker, "worker started");

        loop {
            // Check for shutdown
            if *shutdown_rx.borrow() {
                break;
            }

            let sleep_duration = match self.run_once(&worker).await {
                // More work may be due right away
                Ok(Some(_)) => continue,
                Ok(None) => self.calculate_sleep_duration(),
                Err(e) => {
                    error!(worker = %worker, error = %e, "queue poll failed");
                    self.config.max_sleep
                }
            };

            tokio::select! {
                _ = shutdown_rx.changed() => {}
                _ = sleep(sleep_duration) => {}
            }
        }

        debug!(worker = %worker, "worker stopped");
    }

    /// Calculate how long to sleep until the next job could be due.
    fn calculate_sleep_duration(&self) -> Duration {
        let until_next = match self.queue.next_wakeup() {
            Ok(Some(next)) => (next - Utc::now()).to_std().unwrap_or(Duration::ZERO),
            Ok(None) => self.config.max_sleep,
            Err(e) => {
                warn!(error = %e, "failed to read next wakeup");
                self.config.max_sleep
            }
        };
        until_next.clamp(self.config.min_sleep, self.config.max_sleep)
    }

    async fn dead_lettered(&self, job: Job) {
        match &self.dead_letter {
            Some(hook) => hook(job).await,
            None => warn!(job_id = %job.id, kind = %job.kind, "job dead-lettered with no hook registered"),
        }
    }
}
