//! One-shot commands over the stores. Each prints JSON to stdout.

use chrono::Utc;
use miette::Result;
use plume_pipeline::{CreatePost, EditPost, linked_account};
use plume_providers::Credential;
use plume_store::{LinkedAccount, OAuthStateStore, PendingLink, PostFilter, Scope};
use serde::Serialize;
use serde_json::json;

use crate::app::App;

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value)
        .map_err(|e| miette::miette!("failed to encode output: {}", e))?;
    println!("{}", out);
    Ok(())
}

pub fn schedule(
    app: &App,
    scope: &Scope,
    channels: Vec<String>,
    at: String,
    text: Option<String>,
    media: Vec<String>,
) -> Result<()> {
    let post = app
        .orchestrator()
        .create_post(
            scope,
            CreatePost {
                content: text,
                media,
                channels,
                scheduled_at: at,
            },
        )
        .map_err(|e| miette::miette!("{}", e))?;
    print_json(&post)
}

pub fn list(app: &App, scope: &Scope, filter: PostFilter) -> Result<()> {
    let page = app
        .orchestrator()
        .list(scope, &filter)
        .map_err(|e| miette::miette!("{}", e))?;
    print_json(&page)
}

pub fn show(app: &App, scope: &Scope, post_id: &str) -> Result<()> {
    let orchestrator = app.orchestrator();
    let post = orchestrator
        .get(scope, post_id)
        .map_err(|e| miette::miette!("{}", e))?;
    let attempts = orchestrator
        .list_attempts(scope, post_id)
        .map_err(|e| miette::miette!("{}", e))?;
    print_json(&json!({ "post": post, "attempts": attempts }))
}

pub fn edit(app: &App, scope: &Scope, post_id: &str, patch: EditPost) -> Result<()> {
    let post = app
        .orchestrator()
        .update(scope, post_id, patch)
        .map_err(|e| miette::miette!("{}", e))?;
    print_json(&post)
}

pub fn remove(app: &App, scope: &Scope, post_id: &str) -> Result<()> {
    app.orchestrator()
        .remove(scope, post_id)
        .map_err(|e| miette::miette!("{}", e))?;
    print_json(&json!({ "deleted": post_id }))
}

pub fn cancel(app: &App, scope: &Scope, post_id: &str) -> Result<()> {
    let post = app
        .orchestrator()
        .cancel(scope, post_id)
        .map_err(|e| miette::miette!("{}", e))?;
    print_json(&post)
}

pub fn publish_now(app: &App, scope: &Scope, post_id: &str) -> Result<()> {
    let post = app
        .orchestrator()
        .publish_now(scope, post_id)
        .map_err(|e| miette::miette!("{}", e))?;
    print_json(&post)
}

pub fn retry(app: &App, scope: &Scope, post_id: &str, attempt_id: &str) -> Result<()> {
    let attempt = app
        .orchestrator()
        .retry(scope, post_id, attempt_id)
        .map_err(|e| miette::miette!("{}", e))?;
    print_json(&attempt)
}

/// Store `credential` for the owner. With `state`, the OAuth state must have
/// been issued to this owner for this channel; it is consumed either way.
pub fn link(app: &App, scope: &Scope, credential: Credential, state: Option<&str>) -> Result<()> {
    let now = Utc::now();

    if let Some(state) = state {
        let pending = app
            .oauth
            .consume(state, now)
            .map_err(|e| miette::miette!("{}", e))?
            .ok_or_else(|| miette::miette!("unknown or expired oauth state"))?;
        if pending.owner_id != scope.owner_id || pending.channel != credential.channel {
            return Err(miette::miette!(
                "oauth state was issued for {} on {}",
                pending.owner_id,
                pending.channel
            ));
        }
    }

    let account = linked_account(&scope.owner_id, &credential, now);
    app.accounts
        .link(&account)
        .map_err(|e| miette::miette!("{}", e))?;
    print_json(&account_view(&account))
}

pub fn unlink(app: &App, scope: &Scope, channel: &str) -> Result<()> {
    let channel = channel.to_lowercase();
    let removed = app
        .accounts
        .unlink(&scope.owner_id, &channel)
        .map_err(|e| miette::miette!("{}", e))?;
    if !removed {
        return Err(miette::miette!("no {} account linked", channel));
    }
    print_json(&json!({ "unlinked": channel }))
}

pub fn accounts(app: &App, scope: &Scope) -> Result<()> {
    let accounts = app
        .accounts
        .list(&scope.owner_id)
        .map_err(|e| miette::miette!("{}", e))?;
    let views: Vec<_> = accounts.iter().map(account_view).collect();
    print_json(&views)
}

pub fn oauth_state(
    app: &App,
    scope: &Scope,
    channel: &str,
    redirect_uri: Option<String>,
) -> Result<()> {
    let ttl = OAuthStateStore::default_ttl();
    let link = PendingLink {
        owner_id: scope.owner_id.clone(),
        channel: channel.to_lowercase(),
        redirect_uri,
    };
    let state = app
        .oauth
        .issue(&link, ttl, Utc::now())
        .map_err(|e| miette::miette!("{}", e))?;
    print_json(&json!({
        "state": state,
        "channel": link.channel,
        "expires_in_secs": ttl.num_seconds(),
    }))
}

pub fn dead_letters(app: &App, limit: usize, requeue: Option<&str>) -> Result<()> {
    if let Some(job_id) = requeue {
        let handle = app
            .orchestrator()
            .requeue_dead(job_id)
            .map_err(|e| miette::miette!("{}", e))?;
        return print_json(&json!({ "requeued": handle.id, "run_at": handle.run_at }));
    }

    let stats = app.queue.stats().map_err(|e| miette::miette!("{}", e))?;
    let jobs = app
        .queue
        .dead_letters(limit)
        .map_err(|e| miette::miette!("{}", e))?;
    print_json(&json!({ "stats": stats, "dead": jobs }))
}

/// Account fields safe to print.
fn account_view(account: &LinkedAccount) -> serde_json::Value {
    json!({
        "channel": account.channel,
        "account_id": account.account_id,
        "has_refresh_token": account.refresh_token.is_some(),
        "has_secret": account.secret.is_some(),
        "expires_at": account.expires_at,
        "linked_at": account.linked_at,
    })
}
