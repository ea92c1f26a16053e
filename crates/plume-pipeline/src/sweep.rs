//! Dead-letter handling and periodic reconciliation.
//!
//! Guarantees no post stays `pending` forever: dead-lettered jobs become
//! terminal attempt failures, attempts whose jobs were lost get a new job,
//! and posts whose attempts all resolved get their status re-derived.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use plume_queue::{Job, JobQueue, WorkerPool};
use plume_store::{OAuthStateStore, PostStore, RecordOutcome};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::{PUBLISH_JOB, PipelineError, PublishJob};

/// Sweep configuration.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Time between sweeps.
    pub interval: Duration,
    /// How long past its schedule a pending attempt may go without a live
    /// job before one is enqueued for it.
    pub stranded_grace: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            stranded_grace: Duration::from_secs(300),
        }
    }
}

/// What a single sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub requeued: usize,
    pub settled: usize,
    pub oauth_purged: usize,
    pub jobs_pruned: usize,
}

pub struct Sweeper {
    store: Arc<PostStore>,
    queue: Arc<JobQueue>,
    oauth: Option<Arc<OAuthStateStore>>,
    config: SweepConfig,
}

impl Sweeper {
    pub fn new(store: Arc<PostStore>, queue: Arc<JobQueue>, config: SweepConfig) -> Self {
        Self {
            store,
            queue,
            oauth: None,
            config,
        }
    }

    /// Also purge expired OAuth states on every sweep.
    pub fn with_oauth(mut self, oauth: Arc<OAuthStateStore>) -> Self {
        self.oauth = Some(oauth);
        self
    }

    /// Register the dead-letter hook on the pool.
    pub fn register(self: &Arc<Self>, pool: &mut WorkerPool) {
        let sweeper = Arc::clone(self);
        pool.on_dead_letter(move |job: Job| {
            let sweeper = Arc::clone(&sweeper);
            async move {
                if let Err(e) = sweeper.dead_lettered(&job) {
                    // The stranded-attempt pass picks the attempt up again
                    error!(job_id = %job.id, error = %e, "failed to record dead-lettered job");
                }
            }
        });
    }

    /// Record the attempt behind an abandoned job as failed.
    pub fn dead_lettered(&self, job: &Job) -> Result<(), PipelineError> {
        if job.kind != PUBLISH_JOB {
            warn!(job_id = %job.id, kind = %job.kind, "dead-lettered job of unknown kind");
            return Ok(());
        }
        let payload: PublishJob = match job.payload_as() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "dead-lettered job has malformed payload");
                return Ok(());
            }
        };

        let Some(attempt) = self.store.find_attempt(&payload.post_id, &payload.channel)? else {
            debug!(post_id = %payload.post_id, channel = %payload.channel, "dead-lettered job for a deleted attempt");
            return Ok(());
        };

        let message = format!(
            "delivery abandoned after {} attempts: {}",
            job.attempts,
            job.last_error.as_deref().unwrap_or("unknown error")
        );
        match self.store.record_failure(&attempt.id, &message, Utc::now())? {
            RecordOutcome::Recorded(post) => {
                warn!(
                    post_id = %payload.post_id,
                    channel = %payload.channel,
                    post_status = %post.status,
                    "publish job dead-lettered, attempt marked failed"
                );
            }
            RecordOutcome::Stale => {
                debug!(post_id = %payload.post_id, channel = %payload.channel, "dead-lettered job for a resolved attempt");
            }
        }
        Ok(())
    }

    /// Run one reconciliation pass.
    #[tracing::instrument(skip(self))]
    pub fn sweep_once(&self) -> Result<SweepReport, PipelineError> {
        let now = Utc::now();
        let grace = chrono::Duration::from_std(self.config.stranded_grace)
            .unwrap_or(chrono::Duration::zero());
        let mut report = SweepReport::default();

        for attempt in self.store.stranded_attempts(now - grace, now)? {
            let job = PublishJob::new(&attempt.post_id, &attempt.channel);
            if self.queue.has_live_job(PUBLISH_JOB, &job.key())? {
                continue;
            }
            self.queue.enqueue(job.to_job(Duration::ZERO)?, now)?;
            info!(post_id = %attempt.post_id, channel = %attempt.channel, "re-enqueued stranded attempt");
            report.requeued += 1;
        }

        for post in self.store.settle_unresolved(now)? {
            info!(post_id = %post.id, status = %post.status, "settled post");
            report.settled += 1;
        }

        if let Some(oauth) = &self.oauth {
            report.oauth_purged = oauth.purge_expired(now)?;
        }
        report.jobs_pruned = self.queue.prune()?;

        debug!(?report, "sweep finished");
        Ok(report)
    }

    /// Sweep on an interval until shutdown is signalled.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        info!(interval_secs = self.config.interval.as_secs(), "sweeper starting");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            if let Err(e) = self.sweep_once() {
                error!(error = %e, "sweep failed");
            }

            tokio::select! {
                _ = shutdown_rx.changed() => {}
                _ = sleep(self.config.interval) => {}
            }
        }

        info!("sweeper stopped");
    }
}
