//! Shared fixtures for the pipeline tests, plus end-to-end scenarios.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use plume_providers::{Credential, ProviderRegistry, ScriptedProvider};
use plume_queue::{JobQueue, PoolConfig, QueueConfig, RetryPolicy, WorkerPool};
use plume_store::{AccountStore, OAuthStateStore, Post, PostStore, PublishAttempt, Scope};

use crate::{
    CreatePost, Orchestrator, PublishJob, PublishWorker, SweepConfig, Sweeper, WorkerConfig,
    linked_account,
};

/// An RFC 3339 instant a minute ago.
pub(crate) fn past() -> String {
    (Utc::now() - chrono::Duration::minutes(1)).to_rfc3339()
}

/// Every component wired over in-memory stores, with scripted twitter and
/// instagram providers and a queue that retries without delay.
pub(crate) struct Harness {
    pub scope: Scope,
    pub store: Arc<PostStore>,
    pub queue: Arc<JobQueue>,
    pub accounts: Arc<AccountStore>,
    pub oauth: Arc<OAuthStateStore>,
    pub twitter: Arc<ScriptedProvider>,
    pub instagram: Arc<ScriptedProvider>,
    pub orchestrator: Orchestrator,
    pub worker: Arc<PublishWorker>,
    pub sweeper: Arc<Sweeper>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_worker_config(WorkerConfig::default())
    }

    pub fn with_worker_config(config: WorkerConfig) -> Self {
        let store = Arc::new(PostStore::open_in_memory().unwrap());
        let queue = Arc::new(
            JobQueue::open_in_memory(QueueConfig {
                retry: RetryPolicy {
                    max_attempts: 3,
                    base_delay: Duration::ZERO,
                    max_delay: Duration::ZERO,
                },
                ..QueueConfig::default()
            })
            .unwrap(),
        );
        let accounts = Arc::new(AccountStore::open_in_memory().unwrap());
        let oauth = Arc::new(OAuthStateStore::open_in_memory().unwrap());

        let twitter = Arc::new(ScriptedProvider::new("twitter"));
        let instagram = Arc::new(ScriptedProvider::new("instagram"));
        let mut registry = ProviderRegistry::new();
        registry.register(twitter.clone());
        registry.register(instagram.clone());

        let worker = Arc::new(PublishWorker::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            accounts.clone(),
            Arc::new(registry),
            config,
        ));
        let sweeper = Arc::new(
            Sweeper::new(
                Arc::clone(&store),
                Arc::clone(&queue),
                SweepConfig {
                    interval: Duration::from_secs(60),
                    stranded_grace: Duration::ZERO,
                },
            )
            .with_oauth(Arc::clone(&oauth)),
        );

        Self {
            scope: Scope::new("tenant-1", "user-1"),
            orchestrator: Orchestrator::new(Arc::clone(&store), Arc::clone(&queue)),
            store,
            queue,
            accounts,
            oauth,
            twitter,
            instagram,
            worker,
            sweeper,
        }
    }

    /// Link a bearer credential for `channel` to the harness owner.
    pub fn link(&self, channel: &str) {
        self.link_credential(Credential::bearer(
            channel,
            format!("acct-{}", channel),
            format!("token-{}", channel),
        ));
    }

    pub fn link_credential(&self, credential: Credential) {
        self.accounts
            .link(&linked_account(&self.scope.owner_id, &credential, Utc::now()))
            .unwrap();
    }

    pub fn input(&self, channels: &[&str], scheduled_at: &str) -> CreatePost {
        CreatePost {
            content: Some("hello world".to_string()),
            media: vec![],
            channels: channels.iter().map(|c| c.to_string()).collect(),
            scheduled_at: scheduled_at.to_string(),
        }
    }

    /// Create a post whose scheduled time already passed.
    pub fn create_due(&self, channels: &[&str]) -> Post {
        self.orchestrator
            .create_post(&self.scope, self.input(channels, &past()))
            .unwrap()
    }

    pub fn job(&self, post_id: &str, channel: &str) -> PublishJob {
        PublishJob::new(post_id, channel)
    }

    pub fn post(&self, id: &str) -> Post {
        self.store.find_post(id).unwrap().unwrap()
    }

    pub fn attempt(&self, post_id: &str, channel: &str) -> PublishAttempt {
        self.store.find_attempt(post_id, channel).unwrap().unwrap()
    }

    /// A pool with the publish handler and dead-letter hook registered.
    pub fn pool(&self) -> WorkerPool {
        let mut pool = WorkerPool::new(Arc::clone(&self.queue), PoolConfig::default());
        self.worker.register(&mut pool);
        self.sweeper.register(&mut pool);
        pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Outcome, PipelineError};
    use plume_providers::PublishError;
    use plume_store::PublishStatus;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[tokio::test]
    async fn test_failure_then_retry_waits_for_sibling() {
        let h = Harness::new();
        h.link("twitter");
        h.link("instagram");
        let at = (Utc::now() + chrono::Duration::hours(1)).to_rfc3339();
        let post = h
            .orchestrator
            .create_post(&h.scope, h.input(&["twitter", "instagram"], &at))
            .unwrap();

        let attempts = h.orchestrator.list_attempts(&h.scope, &post.id).unwrap();
        assert_eq!(attempts.len(), 2);
        assert!(attempts.iter().all(|a| a.status == PublishStatus::Pending));
        assert_eq!(h.post(&post.id).status, PublishStatus::Pending);

        // Bring the schedule forward, then run only the twitter job
        h.orchestrator.publish_now(&h.scope, &post.id).unwrap();
        h.twitter.push_err(PublishError::Rejected {
            status: 403,
            body: "duplicate content".to_string(),
        });
        let outcome = h.worker.execute(&h.job(&post.id, "twitter"), false).await.unwrap();
        assert!(matches!(outcome, Outcome::Failed { .. }));

        let twitter = h.attempt(&post.id, "twitter");
        assert_eq!(twitter.status, PublishStatus::Error);
        assert_eq!(twitter.error.as_deref(), Some("HTTP 403: duplicate content"));
        assert_eq!(h.attempt(&post.id, "instagram").status, PublishStatus::Pending);
        assert_eq!(h.post(&post.id).status, PublishStatus::Error);

        // Retry enqueues exactly one job and resets both records
        let queued_before = h.queue.stats().unwrap().queued;
        let retried = h
            .orchestrator
            .retry(&h.scope, &post.id, &twitter.id)
            .unwrap();
        assert_eq!(retried.status, PublishStatus::Pending);
        assert_eq!(retried.error, None);
        assert_eq!(h.queue.stats().unwrap().queued, queued_before + 1);
        let reset = h.post(&post.id);
        assert_eq!(reset.status, PublishStatus::Pending);
        assert_eq!(reset.error, None);

        let outcome = h.worker.execute(&h.job(&post.id, "twitter"), false).await.unwrap();
        assert_eq!(
            outcome,
            Outcome::Published {
                external_id: "twitter-2".to_string(),
                post_status: PublishStatus::Pending,
            }
        );
        assert_eq!(h.post(&post.id).status, PublishStatus::Pending);

        let outcome = h.worker.execute(&h.job(&post.id, "instagram"), false).await.unwrap();
        assert!(matches!(
            outcome,
            Outcome::Published {
                post_status: PublishStatus::Published,
                ..
            }
        ));
        assert_eq!(h.post(&post.id).status, PublishStatus::Published);
    }

    #[tokio::test]
    async fn test_cancel_keeps_published_attempt() {
        let h = Harness::new();
        h.link("twitter");
        h.link("instagram");
        let post = h.create_due(&["twitter", "instagram"]);

        h.worker.execute(&h.job(&post.id, "twitter"), false).await.unwrap();
        let published = h.attempt(&post.id, "twitter");
        assert_eq!(published.status, PublishStatus::Published);

        let canceled = h.orchestrator.cancel(&h.scope, &post.id).unwrap();
        assert_eq!(canceled.status, PublishStatus::Canceled);
        assert_eq!(h.attempt(&post.id, "twitter"), published);
        assert_eq!(h.attempt(&post.id, "instagram").status, PublishStatus::Canceled);

        // The instagram job fires later and is dropped
        h.worker.execute(&h.job(&post.id, "instagram"), false).await.unwrap();
        assert_eq!(h.instagram.calls(), 0);
    }

    #[tokio::test]
    async fn test_retry_rejected_for_published_attempt() {
        let h = Harness::new();
        h.link("twitter");
        h.link("instagram");
        let post = h.create_due(&["twitter", "instagram"]);
        h.worker.execute(&h.job(&post.id, "twitter"), false).await.unwrap();

        let published = h.attempt(&post.id, "twitter");
        let err = h
            .orchestrator
            .retry(&h.scope, &post.id, &published.id)
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidState(_)));

        let err = h
            .orchestrator
            .retry(&h.scope, &post.id, "no-such-attempt")
            .unwrap_err();
        assert!(matches!(err, PipelineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_stranded_sibling_recovered_after_retry() {
        let h = Harness::new();
        h.link("twitter");
        h.link("instagram");
        h.twitter.push_err(PublishError::InvalidContent("too long".to_string()));
        let post = h.create_due(&["twitter", "instagram"]);

        // Whichever order the pool runs them in, twitter fails terminally
        let pool = h.pool();
        pool.drain("w1").await.unwrap();
        assert_eq!(h.post(&post.id).status, PublishStatus::Error);

        let twitter = h.attempt(&post.id, "twitter");
        h.orchestrator.retry(&h.scope, &post.id, &twitter.id).unwrap();
        pool.drain("w1").await.unwrap();
        h.sweeper.sweep_once().unwrap();
        pool.drain("w1").await.unwrap();

        assert_eq!(h.attempt(&post.id, "twitter").status, PublishStatus::Published);
        assert_eq!(h.attempt(&post.id, "instagram").status, PublishStatus::Published);
        assert_eq!(h.post(&post.id).status, PublishStatus::Published);
    }

    fn failure_plan() -> impl Strategy<Value = Vec<bool>> {
        prop::collection::vec(any::<bool>(), 1..4)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn post_published_iff_every_attempt_published(plan in failure_plan()) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let h = Harness::new();
            h.link("twitter");
            h.link("instagram");

            let channels = ["twitter", "instagram"];
            let post = h.create_due(&channels);
            for (channel, fail) in channels.iter().zip(plan.iter().cycle()) {
                let provider = if *channel == "twitter" { &h.twitter } else { &h.instagram };
                if *fail {
                    provider.push_err(PublishError::InvalidContent("rejected".to_string()));
                }
                runtime
                    .block_on(h.worker.execute(&h.job(&post.id, channel), false))
                    .unwrap();
            }

            let attempts = h.store.list_attempts(&h.scope, &post.id).unwrap();
            let all_published = attempts.iter().all(|a| a.status == PublishStatus::Published);
            let post = h.post(&post.id);
            prop_assert_eq!(post.status == PublishStatus::Published, all_published);
            for attempt in &attempts {
                prop_assert_ne!(attempt.status, PublishStatus::Canceled);
            }
        }
    }
}
