//! Scheduling orchestrator.
//!
//! Entry point for every caller-facing operation. Writes go through the
//! [`PostStore`] first and jobs are enqueued after the commit, so a job can
//! never refer to state that was rolled back.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use plume_queue::{JobHandle, JobQueue, JobStatus};
use plume_store::{
    NewPost, Page, Post, PostFilter, PostPatch, PostStore, PublishAttempt, PublishStatus, Scope,
};
use tracing::{info, warn};

use crate::{PUBLISH_JOB, PipelineError, PublishJob};

/// Caller input for a new post.
#[derive(Debug, Clone, Default)]
pub struct CreatePost {
    pub content: Option<String>,
    pub media: Vec<String>,
    pub channels: Vec<String>,
    /// RFC 3339 instant.
    pub scheduled_at: String,
}

/// Caller input for editing a post. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct EditPost {
    pub content: Option<String>,
    pub media: Option<Vec<String>>,
    pub channels: Option<Vec<String>>,
    pub scheduled_at: Option<String>,
}

pub struct Orchestrator {
    store: Arc<PostStore>,
    queue: Arc<JobQueue>,
}

impl Orchestrator {
    pub fn new(store: Arc<PostStore>, queue: Arc<JobQueue>) -> Self {
        Self { store, queue }
    }

    /// Create a pending post and schedule one job per channel.
    #[tracing::instrument(skip(self, input), fields(owner = %scope.owner_id))]
    pub fn create_post(&self, scope: &Scope, input: CreatePost) -> Result<Post, PipelineError> {
        let channels = normalize_channels(input.channels)?;
        let media = validate_media(input.media)?;
        let scheduled_at = parse_instant(&input.scheduled_at)?;
        let content = input.content.filter(|c| !c.trim().is_empty());
        if content.is_none() && media.is_empty() {
            return Err(PipelineError::Validation(
                "post needs text or at least one media item".to_string(),
            ));
        }

        let now = Utc::now();
        let (post, attempts) = self.store.insert_post(
            NewPost {
                scope: scope.clone(),
                content,
                media,
                channels,
                scheduled_at,
            },
            now,
        )?;

        let delay = delay_until(post.scheduled_at, now);
        for attempt in &attempts {
            self.schedule(&post.id, &attempt.channel, delay, now);
        }

        info!(post_id = %post.id, channels = attempts.len(), scheduled_at = %post.scheduled_at, "post scheduled");
        Ok(post)
    }

    pub fn list(&self, scope: &Scope, filter: &PostFilter) -> Result<Page<Post>, PipelineError> {
        Ok(self.store.list_posts(scope, filter)?)
    }

    pub fn get(&self, scope: &Scope, post_id: &str) -> Result<Post, PipelineError> {
        Ok(self.store.get_post(scope, post_id)?)
    }

    pub fn list_attempts(
        &self,
        scope: &Scope,
        post_id: &str,
    ) -> Result<Vec<PublishAttempt>, PipelineError> {
        Ok(self.store.list_attempts(scope, post_id)?)
    }

    /// Edit a pending post.
    ///
    /// New channels get a job at the scheduled time. Moving the schedule
    /// earlier reschedules every pending attempt; moving it later leaves the
    /// existing jobs to defer themselves when they fire.
    #[tracing::instrument(skip(self, edit), fields(owner = %scope.owner_id))]
    pub fn update(
        &self,
        scope: &Scope,
        post_id: &str,
        edit: EditPost,
    ) -> Result<Post, PipelineError> {
        let patch = PostPatch {
            content: edit.content,
            media: edit.media.map(validate_media).transpose()?,
            channels: edit.channels.map(normalize_channels).transpose()?,
            scheduled_at: edit.scheduled_at.as_deref().map(parse_instant).transpose()?,
        };

        let now = Utc::now();
        let update = self.store.update_post(scope, post_id, patch, now)?;
        let delay = delay_until(update.post.scheduled_at, now);

        let reschedule: Vec<&String> = if update.moved_earlier {
            update.pending.iter().collect()
        } else {
            update
                .added
                .iter()
                .filter(|c| update.pending.contains(*c))
                .collect()
        };
        for channel in reschedule {
            self.schedule(post_id, channel, delay, now);
        }

        info!(
            post_id,
            added = ?update.added,
            removed = ?update.removed,
            status = %update.post.status,
            "post updated"
        );
        Ok(update.post)
    }

    /// Delete a pending post and its attempts. Queued jobs go stale.
    #[tracing::instrument(skip(self), fields(owner = %scope.owner_id))]
    pub fn remove(&self, scope: &Scope, post_id: &str) -> Result<(), PipelineError> {
        self.store.delete_post(scope, post_id)?;
        info!(post_id, "post removed");
        Ok(())
    }

    /// Cancel a pending post. Attempts that already resolved keep their status.
    #[tracing::instrument(skip(self), fields(owner = %scope.owner_id))]
    pub fn cancel(&self, scope: &Scope, post_id: &str) -> Result<Post, PipelineError> {
        let (post, attempts) = self.store.cancel_post(scope, post_id, Utc::now())?;
        info!(post_id, attempts = attempts.len(), "post canceled");
        Ok(post)
    }

    /// Publish every still-pending attempt right away.
    ///
    /// Calling this twice only enqueues duplicate jobs; the worker discards
    /// whichever runs second.
    #[tracing::instrument(skip(self), fields(owner = %scope.owner_id))]
    pub fn publish_now(&self, scope: &Scope, post_id: &str) -> Result<Post, PipelineError> {
        let now = Utc::now();
        let (post, pending) = self.store.publish_now(scope, post_id, now)?;
        for channel in &pending {
            self.enqueue(post_id, channel, Duration::ZERO, now)?;
        }
        info!(post_id, channels = pending.len(), "publish requested now");
        Ok(post)
    }

    /// Reset a failed attempt and its post to pending and enqueue one job for it.
    #[tracing::instrument(skip(self), fields(owner = %scope.owner_id))]
    pub fn retry(
        &self,
        scope: &Scope,
        post_id: &str,
        attempt_id: &str,
    ) -> Result<PublishAttempt, PipelineError> {
        let now = Utc::now();
        let (_post, attempt) = self
            .store
            .reset_attempt_for_retry(scope, post_id, attempt_id, now)?;
        self.enqueue(post_id, &attempt.channel, Duration::ZERO, now)?;
        info!(post_id, channel = %attempt.channel, "publish attempt retried");
        Ok(attempt)
    }

    /// Put a dead-lettered job back in the queue.
    ///
    /// A publish job's attempt was marked failed when the job died, so the
    /// attempt and its post are reset to pending first, as [`Self::retry`]
    /// does. Jobs whose attempt resolved some other way are refused.
    #[tracing::instrument(skip(self))]
    pub fn requeue_dead(&self, job_id: &str) -> Result<JobHandle, PipelineError> {
        let job = self
            .queue
            .get(job_id)?
            .ok_or_else(|| PipelineError::NotFound(format!("job {}", job_id)))?;
        if job.status != JobStatus::Dead {
            return Err(PipelineError::InvalidState(format!(
                "job {} is {}, not dead",
                job_id, job.status
            )));
        }

        if job.kind == PUBLISH_JOB {
            let payload: PublishJob = job.payload_as()?;
            let post = self
                .store
                .find_post(&payload.post_id)?
                .ok_or_else(|| PipelineError::NotFound(format!("post {}", payload.post_id)))?;
            let attempt = self
                .store
                .find_attempt(&payload.post_id, &payload.channel)?
                .ok_or_else(|| {
                    PipelineError::NotFound(format!(
                        "publish attempt for {} on {}",
                        payload.post_id, payload.channel
                    ))
                })?;
            match attempt.status {
                PublishStatus::Error => {
                    let scope = Scope::new(post.tenant_id, post.owner_id);
                    self.store
                        .reset_attempt_for_retry(&scope, &post.id, &attempt.id, Utc::now())?;
                }
                PublishStatus::Pending => {}
                status => {
                    return Err(PipelineError::InvalidState(format!(
                        "publish attempt for {} on {} is already {}",
                        payload.post_id, payload.channel, status
                    )));
                }
            }
        }

        Ok(self.queue.requeue_dead(job_id, Utc::now())?)
    }

    fn enqueue(
        &self,
        post_id: &str,
        channel: &str,
        delay: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), PipelineError> {
        let job = PublishJob::new(post_id, channel).to_job(delay)?;
        self.queue.enqueue(job, now)?;
        Ok(())
    }

    /// Enqueue after a committed write. A failure here is left to the sweep,
    /// which re-enqueues pending attempts that have no live job.
    fn schedule(&self, post_id: &str, channel: &str, delay: Duration, now: DateTime<Utc>) {
        if let Err(e) = self.enqueue(post_id, channel, delay, now) {
            warn!(post_id, channel, error = %e, "failed to enqueue publish job");
        }
    }
}

/// Time left until `at`, or zero if it already passed.
pub(crate) fn delay_until(at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (at - now).to_std().unwrap_or(Duration::ZERO)
}

fn parse_instant(value: &str) -> Result<DateTime<Utc>, PipelineError> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| PipelineError::Validation(format!("scheduled time '{}': {}", value, e)))
}

/// Trim, lowercase and dedupe channel names, keeping first-seen order.
fn normalize_channels(channels: Vec<String>) -> Result<Vec<String>, PipelineError> {
    let mut out: Vec<String> = Vec::with_capacity(channels.len());
    for channel in channels {
        let channel = channel.trim().to_lowercase();
        if channel.is_empty() {
            return Err(PipelineError::Validation("empty channel name".to_string()));
        }
        if !out.contains(&channel) {
            out.push(channel);
        }
    }
    if out.is_empty() {
        return Err(PipelineError::Validation(
            "at least one channel is required".to_string(),
        ));
    }
    Ok(out)
}

fn validate_media(media: Vec<String>) -> Result<Vec<String>, PipelineError> {
    let media: Vec<String> = media.into_iter().map(|m| m.trim().to_string()).collect();
    if media.iter().any(String::is_empty) {
        return Err(PipelineError::Validation("empty media reference".to_string()));
    }
    Ok(media)
}
