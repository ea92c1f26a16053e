//! Channel providers for plume.
//!
//! Every channel sits behind the [`Provider`] trait, and the
//! [`ProviderRegistry`] exposes them all through one [`Gateway`].

pub mod bluesky;
mod error;
mod http;
pub mod instagram;
pub mod linkedin;
mod provider;
mod redact;
mod registry;
#[cfg(any(test, feature = "testing"))]
mod scripted;
pub mod twitter;
mod types;
pub mod webhook;

pub use bluesky::BlueskyProvider;
pub use error::PublishError;
pub use http::build_client;
pub use instagram::InstagramProvider;
pub use linkedin::LinkedInProvider;
pub use provider::{Gateway, Provider};
pub use redact::redact;
pub use registry::{ProviderConfig, ProviderRegistry};
#[cfg(any(test, feature = "testing"))]
pub use scripted::ScriptedProvider;
pub use twitter::TwitterProvider;
pub use types::{Content, Credential};
pub use webhook::WebhookProvider;
