//! The provider and gateway seams.

use async_trait::async_trait;

use crate::{Content, Credential, PublishError};

/// Publishes content to one channel.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Channel identifier this provider serves, e.g. `"twitter"`.
    fn channel(&self) -> &str;

    /// Publish and return the channel's identifier for the new post.
    async fn publish(&self, credential: &Credential, content: &Content)
    -> Result<String, PublishError>;
}

/// Uniform entry point over every supported channel.
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn publish(
        &self,
        channel: &str,
        credential: &Credential,
        content: &Content,
    ) -> Result<String, PublishError>;
}
