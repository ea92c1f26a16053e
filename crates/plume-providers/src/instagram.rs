//! Instagram Graph API client.
//!
//! Publishing is two steps: create a media container, then publish it.
//! Several images become a carousel of child containers.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::http::{read_json, send_error};
use crate::{Content, Credential, Provider, PublishError};

pub const DEFAULT_BASE_URL: &str = "https://graph.facebook.com/v19.0";

const MAX_CAROUSEL_ITEMS: usize = 10;
const MAX_CAPTION_CHARS: usize = 2200;

#[derive(Debug, Deserialize)]
struct GraphId {
    id: String,
}

pub struct InstagramProvider {
    http: Client,
    base_url: String,
}

impl InstagramProvider {
    pub fn new(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn post_form(
        &self,
        credential: &Credential,
        edge: &str,
        params: &[(&str, &str)],
    ) -> Result<String, PublishError> {
        let url = format!("{}/{}/{}", self.base_url, credential.account_id, edge);
        let mut form: Vec<(&str, &str)> = params.to_vec();
        form.push(("access_token", credential.access_token.as_str()));

        let response = self
            .http
            .post(&url)
            .form(&form)
            .send()
            .await
            .map_err(|e| send_error(e, credential))?;
        let created: GraphId = read_json(response, credential).await?;
        Ok(created.id)
    }
}

#[async_trait]
impl Provider for InstagramProvider {
    fn channel(&self) -> &str {
        "instagram"
    }

    async fn publish(
        &self,
        credential: &Credential,
        content: &Content,
    ) -> Result<String, PublishError> {
        if content.media.is_empty() {
            return Err(PublishError::InvalidContent(
                "instagram posts need at least one image".to_string(),
            ));
        }
        if content.media.len() > MAX_CAROUSEL_ITEMS {
            return Err(PublishError::InvalidContent(format!(
                "instagram carousels hold at most {} images",
                MAX_CAROUSEL_ITEMS
            )));
        }
        let caption = content.text.as_deref().map(str::trim).unwrap_or_default();
        if caption.chars().count() > MAX_CAPTION_CHARS {
            return Err(PublishError::InvalidContent(format!(
                "caption exceeds {} characters",
                MAX_CAPTION_CHARS
            )));
        }

        let container = if let [image] = content.media.as_slice() {
            self.post_form(credential, "media", &[("image_url", image.as_str()), ("caption", caption)])
                .await?
        } else {
            let mut children = Vec::with_capacity(content.media.len());
            for image in &content.media {
                let child = self
                    .post_form(
                        credential,
                        "media",
                        &[("image_url", image.as_str()), ("is_carousel_item", "true")],
                    )
                    .await?;
                children.push(child);
            }
            let children = children.join(",");
            self.post_form(
                credential,
                "media",
                &[
                    ("media_type", "CAROUSEL"),
                    ("children", children.as_str()),
                    ("caption", caption),
                ],
            )
            .await?
        };
        debug!(container = %container, "instagram container created");

        self.post_form(credential, "media_publish", &[("creation_id", container.as_str())])
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build_client;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> InstagramProvider {
        InstagramProvider::new(build_client(Duration::from_secs(5)).unwrap(), server.uri())
    }

    fn cred() -> Credential {
        Credential::bearer("instagram", "17841400000000000", "ig-long-lived-token")
    }

    #[tokio::test]
    async fn test_single_image_publish() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/17841400000000000/media"))
            .and(body_string_contains("image_url=https%3A%2F%2Fcdn.example%2Fa.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "container-1"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/17841400000000000/media_publish"))
            .and(body_string_contains("creation_id=container-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "ig-media-9"})))
            .expect(1)
            .mount(&server)
            .await;

        let content = Content::new(
            Some("sunset".to_string()),
            vec!["https://cdn.example/a.jpg".to_string()],
        );
        let id = provider(&server).publish(&cred(), &content).await.unwrap();
        assert_eq!(id, "ig-media-9");
    }

    #[tokio::test]
    async fn test_carousel_publish() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/17841400000000000/media"))
            .and(body_string_contains("is_carousel_item=true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "child"})))
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/17841400000000000/media"))
            .and(body_string_contains("media_type=CAROUSEL"))
            .and(body_string_contains("children=child%2Cchild"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "carousel-1"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/17841400000000000/media_publish"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "ig-media-10"})))
            .mount(&server)
            .await;

        let content = Content::new(
            None,
            vec![
                "https://cdn.example/a.jpg".to_string(),
                "https://cdn.example/b.jpg".to_string(),
            ],
        );
        let id = provider(&server).publish(&cred(), &content).await.unwrap();
        assert_eq!(id, "ig-media-10");
    }

    #[tokio::test]
    async fn test_text_only_is_invalid() {
        let server = MockServer::start().await;
        let content = Content::new(Some("no picture".to_string()), vec![]);
        let err = provider(&server).publish(&cred(), &content).await.unwrap_err();
        assert!(matches!(err, PublishError::InvalidContent(_)));
        assert!(!err.retryable());
    }

    #[tokio::test]
    async fn test_graph_error_hides_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/17841400000000000/media"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": {
                    "message": "Invalid OAuth access token - ig-long-lived-token",
                    "type": "OAuthException",
                    "code": 190
                }
            })))
            .mount(&server)
            .await;

        let content = Content::new(None, vec!["https://cdn.example/a.jpg".to_string()]);
        let err = provider(&server).publish(&cred(), &content).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("OAuthException"));
        assert!(!message.contains("ig-long-lived-token"));
    }
}
