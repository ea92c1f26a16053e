//! X / Twitter v2 client.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::http::{read_json, send_error};
use crate::{Content, Credential, Provider, PublishError};

pub const DEFAULT_BASE_URL: &str = "https://api.twitter.com";

/// Longest tweet the API accepts for standard accounts.
const MAX_TWEET_CHARS: usize = 280;

#[derive(Debug, Serialize)]
struct CreateTweetRequest<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreateTweetResponse {
    data: CreatedTweet,
}

#[derive(Debug, Deserialize)]
struct CreatedTweet {
    id: String,
}

/// Posts tweets with a user-context bearer token. Media goes out as links.
pub struct TwitterProvider {
    http: Client,
    base_url: String,
}

impl TwitterProvider {
    pub fn new(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl Provider for TwitterProvider {
    fn channel(&self) -> &str {
        "twitter"
    }

    async fn publish(
        &self,
        credential: &Credential,
        content: &Content,
    ) -> Result<String, PublishError> {
        let text = content.text_with_links();
        if text.is_empty() {
            return Err(PublishError::InvalidContent("tweet has no text".to_string()));
        }
        let chars = text.chars().count();
        if chars > MAX_TWEET_CHARS {
            return Err(PublishError::InvalidContent(format!(
                "tweet is {} characters, limit is {}",
                chars, MAX_TWEET_CHARS
            )));
        }

        let url = format!("{}/2/tweets", self.base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&credential.access_token)
            .json(&CreateTweetRequest { text: &text })
            .send()
            .await
            .map_err(|e| send_error(e, credential))?;

        let created: CreateTweetResponse = read_json(response, credential).await?;
        debug!(tweet_id = %created.data.id, "tweet created");
        Ok(created.data.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build_client;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> TwitterProvider {
        TwitterProvider::new(build_client(Duration::from_secs(5)).unwrap(), server.uri())
    }

    fn cred() -> Credential {
        Credential::bearer("twitter", "2244994945", "tw-user-token-abc")
    }

    #[tokio::test]
    async fn test_publish_returns_tweet_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/2/tweets"))
            .and(header("authorization", "Bearer tw-user-token-abc"))
            .and(body_json(json!({"text": "hello\nhttps://cdn.example/a.png"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "data": {"id": "1445880548472328192", "text": "hello"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let content = Content::new(
            Some("hello".to_string()),
            vec!["https://cdn.example/a.png".to_string()],
        );
        let id = provider(&server).publish(&cred(), &content).await.unwrap();
        assert_eq!(id, "1445880548472328192");
    }

    #[tokio::test]
    async fn test_rate_limit_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/2/tweets"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "900"))
            .mount(&server)
            .await;

        let err = provider(&server)
            .publish(&cred(), &Content::new(Some("hi".to_string()), vec![]))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            PublishError::RateLimited {
                retry_after_secs: Some(900)
            }
        );
        assert!(err.retryable());
    }

    #[tokio::test]
    async fn test_forbidden_is_terminal_and_redacted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/2/tweets"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "title": "Forbidden",
                "detail": "token tw-user-token-abc lacks tweet.write"
            })))
            .mount(&server)
            .await;

        let err = provider(&server)
            .publish(&cred(), &Content::new(Some("hi".to_string()), vec![]))
            .await
            .unwrap_err();
        assert!(!err.retryable());
        let message = err.to_string();
        assert!(message.starts_with("HTTP 403"));
        assert!(!message.contains("tw-user-token-abc"));
        assert!(message.contains("tweet.write"));
    }

    #[tokio::test]
    async fn test_overlong_text_never_hits_network() {
        let server = MockServer::start().await;
        let content = Content::new(Some("x".repeat(281)), vec![]);
        let err = provider(&server).publish(&cred(), &content).await.unwrap_err();
        assert!(matches!(err, PublishError::InvalidContent(_)));
        assert!(server.received_requests().await.unwrap().is_empty());
    }
}
