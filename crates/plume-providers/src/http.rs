//! Shared HTTP plumbing for the channel clients.

use std::time::Duration;

use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;

use crate::redact::{redact, truncate};
use crate::{Credential, PublishError};

/// Longest slice of a response body kept in an error.
pub(crate) const MAX_ERROR_BODY: usize = 500;

/// Build the client shared by every provider.
pub fn build_client(timeout: Duration) -> Result<Client, PublishError> {
    Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(timeout)
        .user_agent(concat!("plume/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| PublishError::Network(e.to_string()))
}

/// Map a transport failure. URLs are dropped since some channels carry tokens in the query.
pub(crate) fn send_error(err: reqwest::Error, credential: &Credential) -> PublishError {
    if err.is_timeout() {
        PublishError::Timeout
    } else {
        PublishError::Network(redact(&err.without_url().to_string(), credential))
    }
}

/// Turn non-success statuses into errors, passing successful responses through.
pub(crate) async fn ensure_success(
    response: Response,
    credential: &Credential,
) -> Result<Response, PublishError> {
    let status = response.status();

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after_secs = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok());
        return Err(PublishError::RateLimited { retry_after_secs });
    }

    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(PublishError::Rejected {
            status: status.as_u16(),
            body: truncate(&redact(body.trim(), credential), MAX_ERROR_BODY),
        });
    }

    Ok(response)
}

/// Decode a successful response body.
pub(crate) async fn json_body<T: DeserializeOwned>(
    response: Response,
    credential: &Credential,
) -> Result<T, PublishError> {
    let text = response
        .text()
        .await
        .map_err(|e| send_error(e, credential))?;
    serde_json::from_str(&text).map_err(|e| {
        PublishError::InvalidResponse(format!(
            "{}: {}",
            e,
            truncate(&redact(&text, credential), 200)
        ))
    })
}

/// Check the status, then decode the body.
pub(crate) async fn read_json<T: DeserializeOwned>(
    response: Response,
    credential: &Credential,
) -> Result<T, PublishError> {
    let response = ensure_success(response, credential).await?;
    json_body(response, credential).await
}
