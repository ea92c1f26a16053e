//! LinkedIn UGC posts client.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::http::{ensure_success, json_body, send_error};
use crate::{Content, Credential, Provider, PublishError};

pub const DEFAULT_BASE_URL: &str = "https://api.linkedin.com";

const MAX_COMMENTARY_CHARS: usize = 3000;

#[derive(Debug, Deserialize)]
struct CreatedShare {
    id: Option<String>,
}

/// Shares as a member. Media URLs are attached as article links.
pub struct LinkedInProvider {
    http: Client,
    base_url: String,
}

impl LinkedInProvider {
    pub fn new(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

/// Accept either a bare member id or a full URN.
fn author_urn(account_id: &str) -> String {
    if account_id.starts_with("urn:li:") {
        account_id.to_string()
    } else {
        format!("urn:li:person:{}", account_id)
    }
}

fn share_body(author: &str, content: &Content) -> Value {
    let text = content.text.as_deref().map(str::trim).unwrap_or_default();
    let (category, media): (&str, Vec<Value>) = if content.media.is_empty() {
        ("NONE", Vec::new())
    } else {
        (
            "ARTICLE",
            content
                .media
                .iter()
                .map(|url| json!({"status": "READY", "originalUrl": url}))
                .collect(),
        )
    };

    json!({
        "author": author,
        "lifecycleState": "PUBLISHED",
        "specificContent": {
            "com.linkedin.ugc.ShareContent": {
                "shareCommentary": {"text": text},
                "shareMediaCategory": category,
                "media": media,
            }
        },
        "visibility": {"com.linkedin.ugc.MemberNetworkVisibility": "PUBLIC"}
    })
}

#[async_trait]
impl Provider for LinkedInProvider {
    fn channel(&self) -> &str {
        "linkedin"
    }

    async fn publish(
        &self,
        credential: &Credential,
        content: &Content,
    ) -> Result<String, PublishError> {
        if content.is_empty() {
            return Err(PublishError::InvalidContent("share is empty".to_string()));
        }
        if content
            .text
            .as_deref()
            .is_some_and(|t| t.chars().count() > MAX_COMMENTARY_CHARS)
        {
            return Err(PublishError::InvalidContent(format!(
                "commentary exceeds {} characters",
                MAX_COMMENTARY_CHARS
            )));
        }

        let url = format!("{}/v2/ugcPosts", self.base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&credential.access_token)
            .header("X-Restli-Protocol-Version", "2.0.0")
            .json(&share_body(&author_urn(&credential.account_id), content))
            .send()
            .await
            .map_err(|e| send_error(e, credential))?;

        let response = ensure_success(response, credential).await?;
        // The share id arrives in a header, and in the body on newer API versions
        let header_id = response
            .headers()
            .get("x-restli-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if let Some(id) = header_id {
            debug!(share_id = %id, "linkedin share created");
            return Ok(id);
        }

        let created: CreatedShare = json_body(response, credential).await?;
        created.id.ok_or_else(|| {
            PublishError::InvalidResponse("share created without an id".to_string())
        })
    }
}
