//! Channel name to provider lookup.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::{
    BlueskyProvider, Content, Credential, Gateway, InstagramProvider, LinkedInProvider, Provider,
    PublishError, TwitterProvider, WebhookProvider, bluesky, build_client, instagram, linkedin,
    twitter,
};

/// Endpoints and limits for the built-in providers.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Whole-request timeout applied by the HTTP client.
    pub request_timeout: Duration,
    pub twitter_url: String,
    pub bluesky_url: String,
    pub linkedin_url: String,
    pub instagram_url: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            twitter_url: twitter::DEFAULT_BASE_URL.to_string(),
            bluesky_url: bluesky::DEFAULT_BASE_URL.to_string(),
            linkedin_url: linkedin::DEFAULT_BASE_URL.to_string(),
            instagram_url: instagram::DEFAULT_BASE_URL.to_string(),
        }
    }
}

/// Dispatches publishes to the provider registered for each channel.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in channel.
    pub fn with_defaults(config: &ProviderConfig) -> Result<Self, PublishError> {
        let http = build_client(config.request_timeout)?;
        let mut registry = Self::new();
        registry.register(Arc::new(TwitterProvider::new(http.clone(), &config.twitter_url)));
        registry.register(Arc::new(BlueskyProvider::new(http.clone(), &config.bluesky_url)));
        registry.register(Arc::new(LinkedInProvider::new(http.clone(), &config.linkedin_url)));
        registry.register(Arc::new(InstagramProvider::new(
            http.clone(),
            &config.instagram_url,
        )));
        registry.register(Arc::new(WebhookProvider::new(http)));
        Ok(registry)
    }

    /// Add or replace the provider for its channel.
    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        let channel = provider.channel().to_string();
        debug!(channel = %channel, "registering provider");
        self.providers.insert(channel, provider);
    }

    /// Registered channel names, sorted.
    pub fn channels(&self) -> Vec<&str> {
        let mut channels: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        channels.sort_unstable();
        channels
    }
}

#[async_trait]
impl Gateway for ProviderRegistry {
    async fn publish(
        &self,
        channel: &str,
        credential: &Credential,
        content: &Content,
    ) -> Result<String, PublishError> {
        let Some(provider) = self.providers.get(channel) else {
            return Err(PublishError::UnsupportedChannel(channel.to_string()));
        };
        provider.publish(credential, content).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ScriptedProvider;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_cover_builtin_channels() {
        let registry = ProviderRegistry::with_defaults(&ProviderConfig::default()).unwrap();
        assert_eq!(
            registry.channels(),
            vec!["bluesky", "instagram", "linkedin", "twitter", "webhook"]
        );
    }

    #[tokio::test]
    async fn test_unknown_channel_is_unsupported() {
        let registry = ProviderRegistry::new();
        let cred = Credential::bearer("myspace", "tom", "token");
        let err = registry
            .publish("myspace", &cred, &Content::default())
            .await
            .unwrap_err();
        assert_eq!(err, PublishError::UnsupportedChannel("myspace".to_string()));
        assert!(!err.retryable());
    }

    #[tokio::test]
    async fn test_dispatches_to_registered_provider() {
        let scripted = Arc::new(ScriptedProvider::new("mastodon"));
        scripted.push_ok("109876");
        let mut registry = ProviderRegistry::new();
        registry.register(scripted.clone());

        let cred = Credential::bearer("mastodon", "@me@example.social", "token");
        let content = Content::new(Some("toot".to_string()), vec![]);
        let id = registry.publish("mastodon", &cred, &content).await.unwrap();
        assert_eq!(id, "109876");
        assert_eq!(scripted.published(), vec![content]);
    }
}
