//! Provider input types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Plain content handed to a provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Content {
    pub text: Option<String>,
    /// Publicly reachable media URLs, in display order.
    pub media: Vec<String>,
}

impl Content {
    pub fn new(text: Option<String>, media: Vec<String>) -> Self {
        Self { text, media }
    }

    /// Text followed by one media URL per line, for text-only channels.
    pub fn text_with_links(&self) -> String {
        let mut parts: Vec<&str> = Vec::with_capacity(1 + self.media.len());
        if let Some(text) = self.text.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            parts.push(text);
        }
        parts.extend(self.media.iter().map(String::as_str));
        parts.join("\n")
    }

    pub fn is_empty(&self) -> bool {
        self.text.as_deref().is_none_or(|t| t.trim().is_empty()) && self.media.is_empty()
    }
}

/// Access material for one channel account.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub channel: String,
    /// Channel-side identity: a DID, person URN, business account id or URL.
    pub account_id: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Signing secret for channels that sign requests.
    pub secret: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    /// A bearer-token credential.
    pub fn bearer(
        channel: impl Into<String>,
        account_id: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            account_id: account_id.into(),
            access_token: access_token.into(),
            refresh_token: None,
            secret: None,
            expires_at: None,
        }
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Every secret value this credential carries.
    pub(crate) fn secrets(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.access_token.as_str())
            .chain(self.refresh_token.as_deref())
            .chain(self.secret.as_deref())
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("channel", &self.channel)
            .field("account_id", &self.account_id)
            .field("access_token", &"[redacted]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[redacted]"))
            .field("secret", &self.secret.as_ref().map(|_| "[redacted]"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_with_links() {
        let content = Content::new(
            Some("  launch day  ".to_string()),
            vec!["https://cdn.example/a.png".to_string()],
        );
        assert_eq!(content.text_with_links(), "launch day\nhttps://cdn.example/a.png");

        let media_only = Content::new(None, vec!["https://cdn.example/b.png".to_string()]);
        assert_eq!(media_only.text_with_links(), "https://cdn.example/b.png");
    }

    #[test]
    fn test_is_empty() {
        assert!(Content::default().is_empty());
        assert!(Content::new(Some("   ".to_string()), vec![]).is_empty());
        assert!(!Content::new(None, vec!["https://cdn.example/a.png".to_string()]).is_empty());
    }

    #[test]
    fn test_debug_hides_secrets() {
        let cred = Credential::bearer("webhook", "https://hooks.example/in", "tok-123456")
            .with_secret("shh-very-secret");
        let rendered = format!("{:?}", cred);
        assert!(!rendered.contains("tok-123456"));
        assert!(!rendered.contains("shh-very-secret"));
        assert!(rendered.contains("hooks.example"));
    }
}
