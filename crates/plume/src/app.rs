//! Stores shared by every command, opened over one SQLite file.

use std::path::Path;
use std::sync::Arc;

use miette::Result;
use plume_pipeline::Orchestrator;
use plume_queue::{JobQueue, QueueConfig};
use plume_store::{AccountStore, OAuthStateStore, PostStore};

pub struct App {
    pub posts: Arc<PostStore>,
    pub queue: Arc<JobQueue>,
    pub accounts: Arc<AccountStore>,
    pub oauth: Arc<OAuthStateStore>,
}

impl App {
    pub fn open(db: &Path, queue_config: QueueConfig) -> Result<Self> {
        let posts = PostStore::open(db).map_err(|e| miette::miette!("failed to open post store: {}", e))?;
        let queue = JobQueue::open(db, queue_config)
            .map_err(|e| miette::miette!("failed to open job queue: {}", e))?;
        let accounts =
            AccountStore::open(db).map_err(|e| miette::miette!("failed to open account store: {}", e))?;
        let oauth = OAuthStateStore::open(db)
            .map_err(|e| miette::miette!("failed to open oauth state store: {}", e))?;

        Ok(Self {
            posts: Arc::new(posts),
            queue: Arc::new(queue),
            accounts: Arc::new(accounts),
            oauth: Arc::new(oauth),
        })
    }

    pub fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(Arc::clone(&self.posts), Arc::clone(&self.queue))
    }
}
