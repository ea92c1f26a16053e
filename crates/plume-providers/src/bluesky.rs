//! Bluesky client over the PDS XRPC interface.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::http::{read_json, send_error};
use crate::{Content, Credential, Provider, PublishError};

pub const DEFAULT_BASE_URL: &str = "https://bsky.social";

const POST_COLLECTION: &str = "app.bsky.feed.post";

/// Post length limit, counted in characters.
const MAX_POST_CHARS: usize = 300;

#[derive(Debug, Serialize)]
struct CreateRecordRequest<'a> {
    repo: &'a str,
    collection: &'a str,
    record: PostRecord<'a>,
}

#[derive(Debug, Serialize)]
struct PostRecord<'a> {
    #[serde(rename = "$type")]
    record_type: &'a str,
    text: &'a str,
    #[serde(rename = "createdAt")]
    created_at: String,
}

#[derive(Debug, Deserialize)]
struct CreateRecordResponse {
    uri: String,
}

/// Creates feed posts in the account's repo. The external id is the record's at:// URI.
pub struct BlueskyProvider {
    http: Client,
    pds_url: String,
}

impl BlueskyProvider {
    pub fn new(http: Client, pds_url: impl Into<String>) -> Self {
        Self {
            http,
            pds_url: pds_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl Provider for BlueskyProvider {
    fn channel(&self) -> &str {
        "bluesky"
    }

    async fn publish(
        &self,
        credential: &Credential,
        content: &Content,
    ) -> Result<String, PublishError> {
        if !credential.account_id.starts_with("did:") {
            return Err(PublishError::Credential(
                "bluesky account id must be a DID".to_string(),
            ));
        }

        let text = content.text_with_links();
        if text.is_empty() {
            return Err(PublishError::InvalidContent("post has no text".to_string()));
        }
        if text.chars().count() > MAX_POST_CHARS {
            return Err(PublishError::InvalidContent(format!(
                "post exceeds {} characters",
                MAX_POST_CHARS
            )));
        }

        let body = CreateRecordRequest {
            repo: &credential.account_id,
            collection: POST_COLLECTION,
            record: PostRecord {
                record_type: POST_COLLECTION,
                text: &text,
                created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            },
        };

        let url = format!("{}/xrpc/com.atproto.repo.createRecord", self.pds_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&credential.access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| send_error(e, credential))?;

        let created: CreateRecordResponse = read_json(response, credential).await?;
        debug!(uri = %created.uri, "bluesky post created");
        Ok(created.uri)
    }
}
