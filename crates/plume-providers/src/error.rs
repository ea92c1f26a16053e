//! Error types for providers.

use thiserror::Error;

/// A failed publish. Messages never carry credential material.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    /// The channel did not answer in time.
    #[error("request timed out")]
    Timeout,

    /// Connection-level failure.
    #[error("network error: {0}")]
    Network(String),

    /// Rate limited.
    #[error("rate limited{}", match retry_after_secs {
        Some(secs) => format!(" (retry after {}s)", secs),
        None => String::new(),
    })]
    RateLimited {
        /// Seconds to wait before retrying (from Retry-After header, optional).
        retry_after_secs: Option<u64>,
    },

    /// The channel API answered with a non-success status.
    #[error("HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    /// The content cannot be published on this channel.
    #[error("invalid content: {0}")]
    InvalidContent(String),

    /// The linked account is not usable for this channel.
    #[error("unusable credential: {0}")]
    Credential(String),

    /// A signed request could not be produced.
    #[error("signature error: {0}")]
    Signature(String),

    /// No provider is registered for the channel.
    #[error("unsupported channel: {0}")]
    UnsupportedChannel(String),

    /// The channel answered success with a body we could not use.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl PublishError {
    /// Whether another attempt could succeed without anyone changing anything.
    pub fn retryable(&self) -> bool {
        match self {
            Self::Timeout | Self::Network(_) | Self::RateLimited { .. } => true,
            Self::Rejected { status, .. } => *status >= 500,
            Self::InvalidContent(_)
            | Self::Credential(_)
            | Self::Signature(_)
            | Self::UnsupportedChannel(_)
            | Self::InvalidResponse(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(PublishError::Timeout.retryable());
        assert!(PublishError::Network("reset".into()).retryable());
        assert!(PublishError::RateLimited { retry_after_secs: Some(30) }.retryable());
        assert!(
            PublishError::Rejected {
                status: 503,
                body: "unavailable".into()
            }
            .retryable()
        );

        assert!(
            !PublishError::Rejected {
                status: 403,
                body: "forbidden".into()
            }
            .retryable()
        );
        assert!(!PublishError::InvalidContent("empty".into()).retryable());
        assert!(!PublishError::UnsupportedChannel("myspace".into()).retryable());
    }

    #[test]
    fn test_rate_limited_display() {
        let err = PublishError::RateLimited {
            retry_after_secs: Some(60),
        };
        assert_eq!(err.to_string(), "rate limited (retry after 60s)");
        let err = PublishError::RateLimited {
            retry_after_secs: None,
        };
        assert_eq!(err.to_string(), "rate limited");
    }
}
