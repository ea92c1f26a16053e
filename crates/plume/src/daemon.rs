//! Daemon command: worker pool and reconciliation sweep.

use std::path::PathBuf;
use std::sync::Arc;

use miette::Result;
use plume_pipeline::{PublishWorker, SweepConfig, Sweeper, WorkerConfig};
use plume_providers::{ProviderConfig, ProviderRegistry};
use plume_queue::{PoolConfig, QueueConfig, WorkerPool};
use tokio::sync::watch;
use tracing::{error, info};

use crate::app::App;

/// Configuration for the daemon.
pub struct DaemonConfig {
    pub db: PathBuf,
    pub queue: QueueConfig,
    pub pool: PoolConfig,
    pub worker: WorkerConfig,
    pub sweep: SweepConfig,
    pub providers: ProviderConfig,
}

/// Run until Ctrl-C.
pub async fn run(config: DaemonConfig) -> Result<()> {
    let app = App::open(&config.db, config.queue)?;

    let registry = ProviderRegistry::with_defaults(&config.providers)
        .map_err(|e| miette::miette!("failed to build providers: {}", e))?;
    info!(channels = ?registry.channels(), "providers registered");

    let worker = Arc::new(PublishWorker::new(
        Arc::clone(&app.posts),
        Arc::clone(&app.queue),
        app.accounts.clone(),
        Arc::new(registry),
        config.worker,
    ));
    let sweeper = Arc::new(
        Sweeper::new(Arc::clone(&app.posts), Arc::clone(&app.queue), config.sweep)
            .with_oauth(Arc::clone(&app.oauth)),
    );

    let mut pool = WorkerPool::new(Arc::clone(&app.queue), config.pool);
    worker.register(&mut pool);
    sweeper.register(&mut pool);
    let pool = Arc::new(pool);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Handle shutdown signals
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    info!(db = %config.db.display(), "daemon started");

    let pool_handle = tokio::spawn(pool.run(shutdown_rx.clone()));
    let sweep_handle = tokio::spawn(sweeper.run(shutdown_rx));

    for (name, handle) in [("worker pool", pool_handle), ("sweeper", sweep_handle)] {
        if let Err(e) = handle.await {
            error!(task = name, error = %e, "task panicked");
        }
    }

    info!("daemon stopped");
    Ok(())
}
