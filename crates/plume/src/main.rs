//! Plume: scheduled multi-channel publishing
//!
//! Main binary with subcommands:
//! - `daemon`: Worker pool and reconciliation sweep
//! - `schedule`, `list`, `show`, `edit`, `remove`, `cancel`, `publish-now`,
//!   `retry`: Post operations
//! - `link`, `unlink`, `accounts`, `oauth-state`: Linked channel accounts
//! - `dead-letters`: Inspect and requeue abandoned jobs

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use miette::Result;
use plume_pipeline::{SweepConfig, WorkerConfig};
use plume_providers::{bluesky, instagram, linkedin, twitter};
use plume_queue::{PoolConfig, QueueConfig, RetryPolicy};
use plume_store::{PublishStatus, Scope};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod app;
mod commands;
mod daemon;

use app::App;

#[derive(Parser)]
#[command(name = "plume")]
#[command(about = "Scheduled multi-channel publishing", long_about = None)]
struct Cli {
    /// SQLite database shared by every store
    #[arg(long, global = true, env = "PLUME_DB", default_value = "plume.db")]
    db: PathBuf,

    /// Tenant the command acts for
    #[arg(long, global = true, env = "PLUME_TENANT", default_value = "default")]
    tenant: String,

    /// Owner the command acts for
    #[arg(long, global = true, env = "PLUME_OWNER", default_value = "local")]
    owner: String,

    /// Delivery attempts per publish job before it is dead-lettered, captured
    /// on each job when it is enqueued
    #[arg(long, global = true, env = "PLUME_MAX_ATTEMPTS", default_value = "3")]
    max_attempts: u32,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct DaemonArgs {
    /// Concurrent publish workers
    #[arg(long, env = "PLUME_WORKERS", default_value = "4")]
    workers: usize,

    /// Per-call provider timeout in seconds
    #[arg(long, env = "PLUME_PUBLISH_TIMEOUT", default_value = "30")]
    publish_timeout: u64,

    /// Job lease in seconds
    #[arg(long, env = "PLUME_LEASE", default_value = "120")]
    lease: u64,

    /// Seconds between reconciliation sweeps
    #[arg(long, env = "PLUME_SWEEP_INTERVAL", default_value = "60")]
    sweep_interval: u64,

    /// Seconds a due attempt may go without a job before the sweep requeues it
    #[arg(long, env = "PLUME_STRANDED_GRACE", default_value = "300")]
    stranded_grace: u64,

    #[arg(long, env = "PLUME_TWITTER_URL", default_value = twitter::DEFAULT_BASE_URL)]
    twitter_url: String,

    #[arg(long, env = "PLUME_BLUESKY_URL", default_value = bluesky::DEFAULT_BASE_URL)]
    bluesky_url: String,

    #[arg(long, env = "PLUME_LINKEDIN_URL", default_value = linkedin::DEFAULT_BASE_URL)]
    linkedin_url: String,

    #[arg(long, env = "PLUME_INSTAGRAM_URL", default_value = instagram::DEFAULT_BASE_URL)]
    instagram_url: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the worker pool and reconciliation sweep until Ctrl-C
    Daemon(DaemonArgs),

    /// Schedule a post
    Schedule {
        /// Target channel (repeatable or comma-separated)
        #[arg(long = "channel", short, required = true, value_delimiter = ',')]
        channels: Vec<String>,

        /// When to publish (RFC 3339)
        #[arg(long)]
        at: String,

        /// Post text
        #[arg(long)]
        text: Option<String>,

        /// Media URL (repeatable)
        #[arg(long)]
        media: Vec<String>,
    },

    /// List posts, latest scheduled first
    List {
        #[arg(long)]
        status: Option<PublishStatus>,

        /// Scheduled at or after (RFC 3339)
        #[arg(long)]
        from: Option<DateTime<Utc>>,

        /// Scheduled at or before (RFC 3339)
        #[arg(long)]
        to: Option<DateTime<Utc>>,

        #[arg(long, default_value = "1")]
        page: u32,

        #[arg(long, default_value = "20")]
        page_size: u32,
    },

    /// Show a post and its publish attempts
    Show { post_id: String },

    /// Edit a pending post
    Edit {
        post_id: String,

        #[arg(long)]
        text: Option<String>,

        /// Replace the media list (repeatable)
        #[arg(long)]
        media: Option<Vec<String>>,

        /// Replace the channel list (repeatable or comma-separated)
        #[arg(long = "channel", value_delimiter = ',')]
        channels: Option<Vec<String>>,

        /// New publish time (RFC 3339)
        #[arg(long)]
        at: Option<String>,
    },

    /// Delete a pending post
    Remove { post_id: String },

    /// Cancel a pending post
    Cancel { post_id: String },

    /// Publish a pending post's remaining channels now
    PublishNow { post_id: String },

    /// Retry a failed publish attempt
    Retry { post_id: String, attempt_id: String },

    /// Link a channel account to the owner
    Link {
        channel: String,

        /// Channel-side identity (DID, member URN, account id, or webhook URL)
        #[arg(long)]
        account_id: String,

        /// Access token
        #[arg(long, env = "PLUME_ACCESS_TOKEN", hide_env_values = true)]
        token: String,

        #[arg(long, env = "PLUME_REFRESH_TOKEN", hide_env_values = true)]
        refresh_token: Option<String>,

        /// Signing secret for signed-request channels
        #[arg(long, env = "PLUME_SIGNING_SECRET", hide_env_values = true)]
        secret: Option<String>,

        /// Credential expiry (RFC 3339)
        #[arg(long)]
        expires_at: Option<DateTime<Utc>>,

        /// OAuth state issued by `oauth-state`, consumed on success
        #[arg(long)]
        state: Option<String>,
    },

    /// Remove a linked channel account
    Unlink { channel: String },

    /// List linked channel accounts
    Accounts,

    /// Issue a single-use OAuth state for linking a channel
    OauthState {
        channel: String,

        #[arg(long)]
        redirect_uri: Option<String>,
    },

    /// Show dead-lettered jobs
    DeadLetters {
        #[arg(long, default_value = "20")]
        limit: usize,

        /// Put a dead job back in the queue
        #[arg(long)]
        requeue: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| {
                "plume=info,plume_pipeline=info,plume_queue=info".to_string()
            }),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let scope = Scope::new(cli.tenant, cli.owner);
    let queue = queue_config(cli.max_attempts);
    let open = || App::open(&cli.db, queue.clone());

    match cli.command {
        Commands::Daemon(args) => {
            daemon::run(daemon_config(cli.db.clone(), queue.clone(), args)).await
        }

        Commands::Schedule {
            channels,
            at,
            text,
            media,
        } => commands::schedule(&open()?, &scope, channels, at, text, media),

        Commands::List {
            status,
            from,
            to,
            page,
            page_size,
        } => commands::list(
            &open()?,
            &scope,
            plume_store::PostFilter {
                status,
                from,
                to,
                page,
                page_size,
            },
        ),

        Commands::Show { post_id } => commands::show(&open()?, &scope, &post_id),

        Commands::Edit {
            post_id,
            text,
            media,
            channels,
            at,
        } => commands::edit(
            &open()?,
            &scope,
            &post_id,
            plume_pipeline::EditPost {
                content: text,
                media,
                channels,
                scheduled_at: at,
            },
        ),

        Commands::Remove { post_id } => commands::remove(&open()?, &scope, &post_id),

        Commands::Cancel { post_id } => commands::cancel(&open()?, &scope, &post_id),

        Commands::PublishNow { post_id } => commands::publish_now(&open()?, &scope, &post_id),

        Commands::Retry {
            post_id,
            attempt_id,
        } => commands::retry(&open()?, &scope, &post_id, &attempt_id),

        Commands::Link {
            channel,
            account_id,
            token,
            refresh_token,
            secret,
            expires_at,
            state,
        } => {
            let mut credential =
                plume_providers::Credential::bearer(channel.to_lowercase(), account_id, token);
            credential.refresh_token = refresh_token;
            credential.secret = secret;
            credential.expires_at = expires_at;
            commands::link(&open()?, &scope, credential, state.as_deref())
        }

        Commands::Unlink { channel } => commands::unlink(&open()?, &scope, &channel),

        Commands::Accounts => commands::accounts(&open()?, &scope),

        Commands::OauthState {
            channel,
            redirect_uri,
        } => commands::oauth_state(&open()?, &scope, &channel, redirect_uri),

        Commands::DeadLetters { limit, requeue } => {
            commands::dead_letters(&open()?, limit, requeue.as_deref())
        }
    }
}

/// Queue settings shared by the daemon and every one-shot command.
fn queue_config(max_attempts: u32) -> QueueConfig {
    QueueConfig {
        retry: RetryPolicy {
            max_attempts: max_attempts.max(1),
            ..RetryPolicy::default()
        },
        ..QueueConfig::default()
    }
}

fn daemon_config(db: PathBuf, queue: QueueConfig, args: DaemonArgs) -> daemon::DaemonConfig {
    let publish_timeout = Duration::from_secs(args.publish_timeout);
    daemon::DaemonConfig {
        db,
        queue: QueueConfig {
            lease_duration: Duration::from_secs(args.lease),
            ..queue
        },
        pool: PoolConfig {
            workers: args.workers.max(1),
            ..PoolConfig::default()
        },
        worker: WorkerConfig {
            publish_timeout,
            ..WorkerConfig::default()
        },
        sweep: SweepConfig {
            interval: Duration::from_secs(args.sweep_interval),
            stranded_grace: Duration::from_secs(args.stranded_grace),
        },
        providers: plume_providers::ProviderConfig {
            request_timeout: publish_timeout,
            twitter_url: args.twitter_url,
            bluesky_url: args.bluesky_url,
            linkedin_url: args.linkedin_url,
            instagram_url: args.instagram_url,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_schedule_accepts_comma_separated_channels() {
        let cli = Cli::try_parse_from([
            "plume",
            "schedule",
            "--channel",
            "twitter,bluesky",
            "--channel",
            "webhook",
            "--at",
            "2030-01-01T09:00:00Z",
            "--text",
            "hello",
        ])
        .unwrap();
        let Commands::Schedule { channels, .. } = cli.command else {
            panic!("expected schedule");
        };
        assert_eq!(channels, vec!["twitter", "bluesky", "webhook"]);
    }

    #[test]
    fn test_daemon_config_from_args() {
        let cli = Cli::try_parse_from(["plume", "--db", "/tmp/p.db", "daemon", "--workers", "0"])
            .unwrap();
        let Commands::Daemon(args) = cli.command else {
            panic!("expected daemon");
        };
        let config = daemon_config(cli.db, queue_config(cli.max_attempts), args);
        assert_eq!(config.pool.workers, 1);
        assert_eq!(config.queue.retry.max_attempts, 3);
        assert_eq!(config.providers.twitter_url, twitter::DEFAULT_BASE_URL);
        assert_eq!(config.worker.publish_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_max_attempts_applies_to_every_command() {
        let cli = Cli::try_parse_from([
            "plume",
            "publish-now",
            "post-1",
            "--max-attempts",
            "5",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::PublishNow { .. }));
        assert_eq!(queue_config(cli.max_attempts).retry.max_attempts, 5);

        let cli = Cli::try_parse_from(["plume", "--max-attempts", "7", "daemon", "--lease", "60"])
            .unwrap();
        let Commands::Daemon(args) = cli.command else {
            panic!("expected daemon");
        };
        let config = daemon_config(cli.db, queue_config(cli.max_attempts), args);
        assert_eq!(config.queue.retry.max_attempts, 7);
        assert_eq!(config.queue.lease_duration, Duration::from_secs(60));
    }
}
