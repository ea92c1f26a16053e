//! The publish job payload.

use std::time::Duration;

use plume_queue::{NewJob, QueueError};
use serde::{Deserialize, Serialize};

/// Job kind for every publish job.
pub const PUBLISH_JOB: &str = "publish";

/// Points at the attempt for (post, channel). Carries no state of its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishJob {
    pub post_id: String,
    pub channel: String,
}

impl PublishJob {
    pub fn new(post_id: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            post_id: post_id.into(),
            channel: channel.into(),
        }
    }

    /// Queue key shared by every job for the same attempt.
    pub fn key(&self) -> String {
        format!("{}:{}", self.post_id, self.channel)
    }

    pub fn to_job(&self, delay: Duration) -> Result<NewJob, QueueError> {
        Ok(NewJob::new(PUBLISH_JOB, self)?.key(self.key()).delay(delay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_job() {
        let job = PublishJob::new("post-1", "twitter")
            .to_job(Duration::from_secs(90))
            .unwrap();
        assert_eq!(job.kind, PUBLISH_JOB);
        assert_eq!(job.key.as_deref(), Some("post-1:twitter"));
        assert_eq!(job.delay, Duration::from_secs(90));
        assert_eq!(job.payload["channel"], "twitter");
    }
}
