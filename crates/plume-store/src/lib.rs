//! Durable state for the plume publishing pipeline.
//!
//! This crate owns the authoritative record of posts and their per-channel
//! publish attempts, plus two small collaborator tables:
//!
//! - **Posts**: content, target channels, schedule and aggregate status
//! - **Publish attempts**: one row per (post, channel), the source of truth
//!   the worker re-validates before every delivery
//! - **Linked accounts**: channel credentials, read once per attempt
//! - **OAuth states**: single-use authorization states with TTL eviction
//!
//! Everything lives in SQLite. Multi-row transitions run inside a single
//! `BEGIN IMMEDIATE` transaction so concurrent workers (in one process or
//! several sharing the same database file) observe them atomically.

mod accounts;
mod db;
mod error;
mod oauth;
mod sqlite;
mod time;
mod types;

pub use accounts::{AccountStore, LinkedAccount};
pub use db::{ClaimResult, PostStore, PostUpdate, RecordOutcome};
pub use error::StoreError;
pub use oauth::{OAuthStateStore, PendingLink};
pub use time::{format_ts, parse_ts};
pub use types::{
    NewPost, Page, Post, PostFilter, PostPatch, PublishAttempt, PublishStatus, Scope, roll_up,
};
