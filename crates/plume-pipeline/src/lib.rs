//! The scheduled multi-channel publishing pipeline.
//!
//! - [`Orchestrator`] creates posts and re-drives the queue for cancel,
//!   publish-now, retry and edits
//! - [`PublishWorker`] executes publish jobs against live attempt state
//! - [`Sweeper`] turns dead-lettered jobs into failures and recovers
//!   attempts whose jobs went missing

mod credentials;
mod error;
mod orchestrator;
mod payload;
mod sweep;
#[cfg(test)]
mod testing;
mod worker;

pub use credentials::{CredentialStore, linked_account};
pub use error::PipelineError;
pub use orchestrator::{CreatePost, EditPost, Orchestrator};
pub use payload::{PUBLISH_JOB, PublishJob};
pub use sweep::{SweepConfig, SweepReport, Sweeper};
pub use worker::{
    CREDENTIAL_EXPIRED, Discard, NO_LINKED_ACCOUNT, Outcome, PublishWorker, WorkerConfig,
};
