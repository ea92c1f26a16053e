//! Publish worker: executes one publish job against live attempt state.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use plume_providers::{Content, Gateway, PublishError};
use plume_queue::{Job, JobQueue, WorkerPool};
use plume_store::{ClaimResult, PostStore, PublishStatus, RecordOutcome};
use tracing::{debug, info, warn};

use crate::orchestrator::delay_until;
use crate::{CredentialStore, PUBLISH_JOB, PipelineError, PublishJob};

/// Message recorded when the owner has no linked account for the channel.
pub const NO_LINKED_ACCOUNT: &str = "no linked account";
/// Message recorded when the linked account's credential has expired.
pub const CREDENTIAL_EXPIRED: &str = "linked account credential expired";

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Upper bound on a single gateway call.
    pub publish_timeout: Duration,
    /// Extra time an attempt claim outlives the publish timeout.
    pub claim_margin: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            publish_timeout: Duration::from_secs(30),
            claim_margin: Duration::from_secs(30),
        }
    }
}

/// Why a job was dropped without touching the attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discard {
    /// The payload could not be decoded.
    Malformed,
    /// The post or attempt no longer exists.
    Missing,
    /// The post is no longer pending.
    PostResolved(PublishStatus),
    /// The attempt is no longer pending.
    AttemptResolved(PublishStatus),
    /// Another job holds a live claim on the attempt.
    InFlight,
}

/// What executing a job did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The attempt was published.
    Published {
        external_id: String,
        post_status: PublishStatus,
    },
    /// A terminal failure was recorded on the attempt.
    Failed {
        message: String,
        post_status: PublishStatus,
    },
    /// The post is scheduled later than the job fired; a new job was enqueued.
    Deferred { run_at: DateTime<Utc> },
    /// The attempt resolved elsewhere while the gateway call was in flight.
    Superseded,
    Discarded(Discard),
}

pub struct PublishWorker {
    store: Arc<PostStore>,
    queue: Arc<JobQueue>,
    credentials: Arc<dyn CredentialStore>,
    gateway: Arc<dyn Gateway>,
    config: WorkerConfig,
}

impl PublishWorker {
    pub fn new(
        store: Arc<PostStore>,
        queue: Arc<JobQueue>,
        credentials: Arc<dyn CredentialStore>,
        gateway: Arc<dyn Gateway>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            queue,
            credentials,
            gateway,
            config,
        }
    }

    /// Register this worker as the pool's publish handler.
    pub fn register(self: &Arc<Self>, pool: &mut WorkerPool) {
        let worker = Arc::clone(self);
        pool.on_job(PUBLISH_JOB, move |job: Job| {
            let worker = Arc::clone(&worker);
            async move {
                worker
                    .handle(job)
                    .await
                    .map(|_| ())
                    .map_err(|e| e.to_string())
            }
        });
    }

    /// Queue-facing entry point. `Err` hands the job back to the queue for retry.
    pub async fn handle(&self, job: Job) -> Result<Outcome, PipelineError> {
        let payload: PublishJob = match job.payload_as() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "discarding publish job with malformed payload");
                return Ok(Outcome::Discarded(Discard::Malformed));
            }
        };
        self.execute(&payload, job.is_final_attempt()).await
    }

    /// Run the publish state machine for one attempt.
    ///
    /// `final_attempt` is true when the queue will not redeliver this job, in
    /// which case retryable provider failures are recorded as terminal.
    #[tracing::instrument(skip(self, job), fields(post_id = %job.post_id, channel = %job.channel))]
    pub async fn execute(
        &self,
        job: &PublishJob,
        final_attempt: bool,
    ) -> Result<Outcome, PipelineError> {
        let Some(post) = self.store.find_post(&job.post_id)? else {
            debug!("post gone, discarding stale job");
            return Ok(Outcome::Discarded(Discard::Missing));
        };
        let Some(attempt) = self.store.find_attempt(&job.post_id, &job.channel)? else {
            debug!("attempt gone, discarding stale job");
            return Ok(Outcome::Discarded(Discard::Missing));
        };
        if post.status != PublishStatus::Pending {
            debug!(status = %post.status, "post no longer pending");
            return Ok(Outcome::Discarded(Discard::PostResolved(post.status)));
        }
        if attempt.status != PublishStatus::Pending {
            debug!(status = %attempt.status, "attempt no longer pending");
            return Ok(Outcome::Discarded(Discard::AttemptResolved(attempt.status)));
        }

        let now = Utc::now();
        if now < post.scheduled_at {
            let handle = self
                .queue
                .enqueue(job.to_job(delay_until(post.scheduled_at, now))?, now)?;
            debug!(run_at = %handle.run_at, "job fired early, deferred");
            return Ok(Outcome::Deferred {
                run_at: handle.run_at,
            });
        }

        let hold = self.config.publish_timeout + self.config.claim_margin;
        let until = now + chrono::Duration::from_std(hold).unwrap_or(chrono::Duration::zero());
        match self.store.claim_attempt(&attempt.id, until, now)? {
            ClaimResult::Claimed => {}
            ClaimResult::InFlight { until } => {
                debug!(%until, "attempt claimed by another job");
                return Ok(Outcome::Discarded(Discard::InFlight));
            }
            ClaimResult::Resolved(status) => {
                return Ok(Outcome::Discarded(Discard::AttemptResolved(status)));
            }
            ClaimResult::Missing => return Ok(Outcome::Discarded(Discard::Missing)),
        }

        let credential = match self.credentials.get_credential(&post.owner_id, &job.channel) {
            Ok(credential) => credential,
            Err(e) => {
                self.release(&attempt.id);
                return Err(e.into());
            }
        };
        let credential = match credential {
            None => return self.fail(&attempt.id, NO_LINKED_ACCOUNT),
            Some(c) if c.is_expired(Utc::now()) => return self.fail(&attempt.id, CREDENTIAL_EXPIRED),
            Some(c) => c,
        };

        let content = Content::new(post.content.clone(), post.media.clone());
        let result = tokio::time::timeout(
            self.config.publish_timeout,
            self.gateway.publish(&job.channel, &credential, &content),
        )
        .await
        .unwrap_or(Err(PublishError::Timeout));

        match result {
            Ok(external_id) => {
                match self
                    .store
                    .record_success(&attempt.id, Some(&external_id), Utc::now())?
                {
                    RecordOutcome::Recorded(post) => {
                        info!(external_id = %external_id, post_status = %post.status, "published");
                        Ok(Outcome::Published {
                            external_id,
                            post_status: post.status,
                        })
                    }
                    RecordOutcome::Stale => {
                        warn!(external_id = %external_id, "published, but the attempt was resolved while the call was in flight");
                        Ok(Outcome::Superseded)
                    }
                }
            }
            Err(err) if err.retryable() && !final_attempt => {
                warn!(error = %err, "transient publish failure, returning job to the queue");
                self.release(&attempt.id);
                Err(PipelineError::Provider(err))
            }
            Err(err) => self.fail(&attempt.id, &err.to_string()),
        }
    }

    fn fail(&self, attempt_id: &str, message: &str) -> Result<Outcome, PipelineError> {
        match self.store.record_failure(attempt_id, message, Utc::now())? {
            RecordOutcome::Recorded(post) => {
                warn!(error = %message, post_status = %post.status, "publish failed");
                Ok(Outcome::Failed {
                    message: message.to_string(),
                    post_status: post.status,
                })
            }
            RecordOutcome::Stale => {
                warn!(error = %message, "publish failed, but the attempt was already resolved");
                Ok(Outcome::Superseded)
            }
        }
    }

    fn release(&self, attempt_id: &str) {
        if let Err(e) = self.store.release_claim(attempt_id, Utc::now()) {
            // The claim expires on its own
            warn!(attempt_id, error = %e, "failed to release attempt claim");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Harness, past};
    use plume_providers::Credential;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_publish_success_rolls_up() {
        let h = Harness::new();
        h.link("twitter");
        let post = h.create_due(&["twitter"]);

        let outcome = h.worker.execute(&h.job(&post.id, "twitter"), false).await.unwrap();
        assert_eq!(
            outcome,
            Outcome::Published {
                external_id: "twitter-1".to_string(),
                post_status: PublishStatus::Published,
            }
        );

        let attempt = h.attempt(&post.id, "twitter");
        assert_eq!(attempt.status, PublishStatus::Published);
        assert_eq!(attempt.external_id.as_deref(), Some("twitter-1"));
        assert!(attempt.published_at.is_some());
        assert!(attempt.claimed_until.is_none());
    }

    #[tokio::test]
    async fn test_missing_credential_is_terminal() {
        let h = Harness::new();
        let post = h.create_due(&["twitter"]);

        let outcome = h.worker.execute(&h.job(&post.id, "twitter"), false).await.unwrap();
        assert_eq!(
            outcome,
            Outcome::Failed {
                message: NO_LINKED_ACCOUNT.to_string(),
                post_status: PublishStatus::Error,
            }
        );
        assert_eq!(h.twitter.calls(), 0);
        let post = h.post(&post.id);
        assert_eq!(post.error.as_deref(), Some("twitter: no linked account"));
    }

    #[tokio::test]
    async fn test_expired_credential_is_terminal() {
        let h = Harness::new();
        let mut cred = Credential::bearer("twitter", "42", "old-token");
        cred.expires_at = Some(Utc::now() - chrono::Duration::days(1));
        h.link_credential(cred);
        let post = h.create_due(&["twitter"]);

        let outcome = h.worker.execute(&h.job(&post.id, "twitter"), false).await.unwrap();
        assert!(matches!(outcome, Outcome::Failed { ref message, .. } if message == CREDENTIAL_EXPIRED));
        assert_eq!(h.twitter.calls(), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_returns_to_queue() {
        let h = Harness::new();
        h.link("twitter");
        h.twitter.push_err(PublishError::Rejected {
            status: 503,
            body: "over capacity".to_string(),
        });
        let post = h.create_due(&["twitter"]);

        let err = h
            .worker
            .execute(&h.job(&post.id, "twitter"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Provider(_)));

        // Attempt stays pending and unclaimed so the redelivery can run
        let attempt = h.attempt(&post.id, "twitter");
        assert_eq!(attempt.status, PublishStatus::Pending);
        assert!(attempt.claimed_until.is_none());

        let outcome = h.worker.execute(&h.job(&post.id, "twitter"), false).await.unwrap();
        assert!(matches!(outcome, Outcome::Published { .. }));
    }

    #[tokio::test]
    async fn test_transient_failure_on_final_attempt_is_recorded() {
        let h = Harness::new();
        h.link("twitter");
        h.twitter.push_err(PublishError::Timeout);
        let post = h.create_due(&["twitter"]);

        let outcome = h.worker.execute(&h.job(&post.id, "twitter"), true).await.unwrap();
        assert_eq!(
            outcome,
            Outcome::Failed {
                message: "request timed out".to_string(),
                post_status: PublishStatus::Error,
            }
        );
    }

    #[tokio::test]
    async fn test_gateway_call_is_bounded() {
        let h = Harness::with_worker_config(WorkerConfig {
            publish_timeout: Duration::from_millis(50),
            claim_margin: Duration::from_millis(50),
        });
        h.link("twitter");
        h.twitter.set_delay(Some(Duration::from_secs(5)));
        let post = h.create_due(&["twitter"]);

        let outcome = h.worker.execute(&h.job(&post.id, "twitter"), true).await.unwrap();
        assert!(matches!(outcome, Outcome::Failed { ref message, .. } if message == "request timed out"));
    }

    #[tokio::test]
    async fn test_stale_jobs_are_discarded() {
        let h = Harness::new();
        h.link("twitter");
        let post = h.create_due(&["twitter"]);

        let missing = h.worker.execute(&h.job("no-such-post", "twitter"), false).await.unwrap();
        assert_eq!(missing, Outcome::Discarded(Discard::Missing));
        let missing = h.worker.execute(&h.job(&post.id, "linkedin"), false).await.unwrap();
        assert_eq!(missing, Outcome::Discarded(Discard::Missing));

        h.orchestrator.cancel(&h.scope, &post.id).unwrap();
        let canceled = h.worker.execute(&h.job(&post.id, "twitter"), false).await.unwrap();
        assert_eq!(
            canceled,
            Outcome::Discarded(Discard::PostResolved(PublishStatus::Canceled))
        );
        assert_eq!(h.twitter.calls(), 0);
    }

    #[tokio::test]
    async fn test_early_job_is_deferred() {
        let h = Harness::new();
        h.link("twitter");
        let at = Utc::now() + chrono::Duration::hours(2);
        let post = h
            .orchestrator
            .create_post(&h.scope, h.input(&["twitter"], &at.to_rfc3339()))
            .unwrap();

        let outcome = h.worker.execute(&h.job(&post.id, "twitter"), false).await.unwrap();
        let Outcome::Deferred { run_at } = outcome else {
            panic!("expected deferral, got {:?}", outcome);
        };
        assert!((run_at - at).num_seconds().abs() <= 1);
        assert_eq!(h.twitter.calls(), 0);
    }

    #[tokio::test]
    async fn test_published_attempt_is_never_republished() {
        let h = Harness::new();
        h.link("twitter");
        let post = h.create_due(&["twitter"]);

        let first = h.worker.execute(&h.job(&post.id, "twitter"), false).await.unwrap();
        assert!(matches!(first, Outcome::Published { .. }));
        let before = h.attempt(&post.id, "twitter");

        // Post is published now, so the duplicate is discarded at the post check
        let second = h.worker.execute(&h.job(&post.id, "twitter"), false).await.unwrap();
        assert_eq!(
            second,
            Outcome::Discarded(Discard::PostResolved(PublishStatus::Published))
        );
        assert_eq!(h.twitter.calls(), 1);
        assert_eq!(h.attempt(&post.id, "twitter"), before);
    }

    #[tokio::test]
    async fn test_concurrent_duplicates_publish_once() {
        let h = Harness::new();
        h.link("twitter");
        h.twitter.set_delay(Some(Duration::from_millis(100)));
        let post = h.create_due(&["twitter"]);
        let job = h.job(&post.id, "twitter");

        let (a, b) = tokio::join!(h.worker.execute(&job, false), h.worker.execute(&job, false));
        let outcomes = [a.unwrap(), b.unwrap()];

        assert_eq!(h.twitter.calls(), 1);
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| matches!(o, Outcome::Published { .. }))
                .count(),
            1
        );
        assert!(outcomes.contains(&Outcome::Discarded(Discard::InFlight)));
    }

    #[tokio::test]
    async fn test_cancel_mid_flight_is_tolerated() {
        let h = Harness::new();
        h.link("twitter");
        h.twitter.set_delay(Some(Duration::from_millis(100)));
        let post = h.create_due(&["twitter"]);
        let job = h.job(&post.id, "twitter");

        let cancel = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            h.orchestrator.cancel(&h.scope, &post.id).unwrap()
        };
        let (outcome, canceled) = tokio::join!(h.worker.execute(&job, false), cancel);

        assert_eq!(outcome.unwrap(), Outcome::Superseded);
        assert_eq!(canceled.status, PublishStatus::Canceled);
        assert_eq!(h.attempt(&post.id, "twitter").status, PublishStatus::Canceled);
    }

    #[tokio::test]
    async fn test_worker_pool_drives_jobs() {
        let h = Harness::new();
        h.link("twitter");
        h.link("instagram");
        let post = h
            .orchestrator
            .create_post(&h.scope, h.input(&["twitter", "instagram"], &past()))
            .unwrap();

        let pool = h.pool();
        assert_eq!(pool.drain("w1").await.unwrap(), 2);
        assert_eq!(h.post(&post.id).status, PublishStatus::Published);
        assert_eq!(h.queue.stats().unwrap().completed, 2);
    }

    #[tokio::test]
    async fn test_worker_pool_retries_then_publishes() {
        let h = Harness::new();
        h.link("twitter");
        h.twitter.push_err(PublishError::Network("connection reset".to_string()));
        let post = h
            .orchestrator
            .create_post(&h.scope, h.input(&["twitter"], &past()))
            .unwrap();

        let pool = h.pool();
        pool.drain("w1").await.unwrap();
        assert_eq!(h.twitter.calls(), 2);
        assert_eq!(h.post(&post.id).status, PublishStatus::Published);
    }
}
