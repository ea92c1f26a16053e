//! Queue types.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::QueueError;

/// A unit of delayed work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job id.
    pub id: String,
    /// Handler the job is routed to.
    pub kind: String,
    /// Correlation key used to ask whether work for an entity is in flight.
    pub key: Option<String>,
    /// Handler input.
    pub payload: serde_json::Value,
    /// Current status of the job.
    pub status: JobStatus,
    /// Earliest time the job may be delivered.
    pub run_at: DateTime<Utc>,
    /// Deliveries so far, including the current one while leased.
    pub attempts: u32,
    /// Retry policy captured at enqueue time.
    pub retry: RetryPolicy,
    /// Error reported by the most recent failed delivery.
    pub last_error: Option<String>,
    /// Worker holding the lease.
    pub lease_owner: Option<String>,
    /// When the lease lapses and the job becomes visible again.
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Decode the payload.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, QueueError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// True when a failure of the current delivery exhausts the retry budget.
    pub fn is_final_attempt(&self) -> bool {
        self.attempts >= self.retry.max_attempts
    }
}

/// Current status of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for `run_at`.
    #[default]
    Queued,
    /// Delivered to a worker that has not acknowledged it yet.
    Leased,
    /// Acknowledged.
    Completed,
    /// Retry budget exhausted; no further automatic delivery.
    Dead,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Leased => "leased",
            Self::Completed => "completed",
            Self::Dead => "dead",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "leased" => Ok(Self::Leased),
            "completed" => Ok(Self::Completed),
            "dead" => Ok(Self::Dead),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total deliveries before the job is dead-lettered.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(3600),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next delivery after `failures` failed deliveries.
    ///
    /// Doubles per failure: base, 2*base, 4*base, ... capped at `max_delay`.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(20);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }
}

/// A job waiting to be admitted.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub kind: String,
    pub key: Option<String>,
    pub payload: serde_json::Value,
    pub delay: Duration,
    pub retry: Option<RetryPolicy>,
}

impl NewJob {
    /// Build a job of `kind` carrying `payload`, visible immediately.
    pub fn new<T: Serialize>(kind: impl Into<String>, payload: &T) -> Result<Self, QueueError> {
        Ok(Self {
            kind: kind.into(),
            key: None,
            payload: serde_json::to_value(payload)?,
            delay: Duration::ZERO,
            retry: None,
        })
    }

    /// Set the correlation key.
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Hide the job from consumers for `delay`.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Override the queue's default retry policy.
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }
}

/// Receipt for an admitted job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobHandle {
    pub id: String,
    pub run_at: DateTime<Utc>,
}

/// What happened to a job whose delivery failed.
#[derive(Debug, Clone)]
pub enum FailOutcome {
    /// Requeued for another delivery.
    Retrying { run_at: DateTime<Utc> },
    /// Moved to the dead-letter set.
    Dead(Job),
    /// The lease had already passed to another worker.
    LeaseLost,
}

/// Job counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queued: u64,
    pub leased: u64,
    pub completed: u64,
    pub dead: u64,
}

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// How long a delivered job stays invisible to other workers.
    pub lease_duration: Duration,
    /// Policy for jobs that do not bring their own.
    pub retry: RetryPolicy,
    /// Completed jobs kept for inspection.
    pub keep_completed: usize,
    /// Dead jobs kept for inspection and requeueing.
    pub keep_dead: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(120),
            retry: RetryPolicy::default(),
            keep_completed: 100,
            keep_dead: 1000,
        }
    }
}
