//! Signed webhook delivery to a custom endpoint.
//!
//! The credential's account id is the endpoint URL. Every request carries
//! `X-Plume-Signature: sha256=<hex>` over `"{timestamp}.{body}"`, keyed by the
//! credential secret, so receivers can authenticate and reject replays.

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::debug;

use crate::http::{read_json, send_error};
use crate::{Content, Credential, Provider, PublishError};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Plume-Signature";
pub const TIMESTAMP_HEADER: &str = "X-Plume-Timestamp";
pub const KEY_HEADER: &str = "X-Plume-Key";

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    text: Option<&'a str>,
    media: &'a [String],
    sent_at: String,
}

#[derive(Debug, Deserialize)]
struct WebhookAck {
    id: String,
}

/// Hex HMAC-SHA256 of `"{timestamp}.{body}"`.
pub fn sign(secret: &str, timestamp: i64, body: &str) -> Result<String, PublishError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| PublishError::Signature(e.to_string()))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

pub struct WebhookProvider {
    http: Client,
}

impl WebhookProvider {
    pub fn new(http: Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Provider for WebhookProvider {
    fn channel(&self) -> &str {
        "webhook"
    }

    async fn publish(
        &self,
        credential: &Credential,
        content: &Content,
    ) -> Result<String, PublishError> {
        let endpoint = credential.account_id.as_str();
        if !(endpoint.starts_with("https://") || endpoint.starts_with("http://")) {
            return Err(PublishError::Credential(
                "webhook account id must be an http(s) URL".to_string(),
            ));
        }
        let Some(secret) = credential.secret.as_deref().filter(|s| !s.is_empty()) else {
            return Err(PublishError::Signature(
                "webhook credential has no signing secret".to_string(),
            ));
        };
        if content.is_empty() {
            return Err(PublishError::InvalidContent("payload is empty".to_string()));
        }

        let now = Utc::now();
        let body = serde_json::to_string(&WebhookPayload {
            text: content.text.as_deref(),
            media: &content.media,
            sent_at: now.to_rfc3339(),
        })
        .map_err(|e| PublishError::InvalidContent(e.to_string()))?;
        let timestamp = now.timestamp();
        let signature = sign(secret, timestamp, &body)?;

        let response = self
            .http
            .post(endpoint)
            .header("content-type", "application/json")
            .header(KEY_HEADER, &credential.access_token)
            .header(TIMESTAMP_HEADER, timestamp.to_string())
            .header(SIGNATURE_HEADER, format!("sha256={}", signature))
            .body(body)
            .send()
            .await
            .map_err(|e| send_error(e, credential))?;

        let ack: WebhookAck = read_json(response, credential).await?;
        debug!(id = %ack.id, "webhook acknowledged");
        Ok(ack.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build_client;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn cred(server: &MockServer) -> Credential {
        Credential::bearer("webhook", format!("{}/hooks/plume", server.uri()), "key-abc")
            .with_secret("whsec-0123456789")
    }

    #[test]
    fn test_sign_covers_key_timestamp_and_body() {
        let sig = sign("Jefe", 0, "what do ya want for nothing?").unwrap();
        assert_eq!(sig.len(), 64);
        assert_ne!(sig, sign("Jefe", 1, "what do ya want for nothing?").unwrap());
        assert_ne!(sig, sign("Jefe2", 0, "what do ya want for nothing?").unwrap());
    }

    #[tokio::test]
    async fn test_delivery_is_signed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hooks/plume"))
            .and(header("x-plume-key", "key-abc"))
            .and(header_exists("x-plume-timestamp"))
            .and(header_exists("x-plume-signature"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "evt_77"})))
            .mount(&server)
            .await;

        let provider = WebhookProvider::new(build_client(Duration::from_secs(5)).unwrap());
        let content = Content::new(Some("release notes".to_string()), vec![]);
        let id = provider.publish(&cred(&server), &content).await.unwrap();
        assert_eq!(id, "evt_77");

        let requests = server.received_requests().await.unwrap();
        let request = &requests[0];
        let timestamp: i64 = request.headers["x-plume-timestamp"]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        let body = String::from_utf8(request.body.clone()).unwrap();
        let expected = format!("sha256={}", sign("whsec-0123456789", timestamp, &body).unwrap());
        assert_eq!(request.headers["x-plume-signature"].to_str().unwrap(), expected);
        assert!(body.contains("release notes"));
    }

    #[tokio::test]
    async fn test_missing_secret_is_signature_error() {
        let server = MockServer::start().await;
        let provider = WebhookProvider::new(build_client(Duration::from_secs(5)).unwrap());
        let cred = Credential::bearer("webhook", server.uri(), "key-abc");
        let err = provider
            .publish(&cred, &Content::new(Some("x".to_string()), vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Signature(_)));
        assert!(!err.retryable());
    }

    #[tokio::test]
    async fn test_non_url_account_is_credential_error() {
        let provider = WebhookProvider::new(build_client(Duration::from_secs(5)).unwrap());
        let cred = Credential::bearer("webhook", "not a url", "key").with_secret("whsec-0123");
        let err = provider
            .publish(&cred, &Content::new(Some("x".to_string()), vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Credential(_)));
    }
}
