//! Single-use OAuth authorization states.
//!
//! A state is issued when an owner starts linking a channel and consumed when
//! the provider redirects back. States live in the shared database with an
//! explicit expiry, so any instance can complete a flow another one started,
//! and the reconciliation sweep evicts the ones nobody came back for.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, TransactionBehavior, params};
use tracing::debug;
use uuid::Uuid;

use crate::error::StoreError;
use crate::sqlite::{OptionalExt, open_file, open_memory};
use crate::time::format_ts;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS oauth_states (
        state TEXT PRIMARY KEY,
        owner_id TEXT NOT NULL,
        channel TEXT NOT NULL,
        redirect_uri TEXT,
        expires_at TEXT NOT NULL,
        created_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_oauth_states_expiry ON oauth_states(expires_at);
";

/// The flow a consumed state belonged to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingLink {
    pub owner_id: String,
    pub channel: String,
    pub redirect_uri: Option<String>,
}

/// SQLite-backed OAuth state table with TTL eviction.
pub struct OAuthStateStore {
    conn: Mutex<Connection>,
}

impl OAuthStateStore {
    /// Default lifetime of an issued state.
    pub fn default_ttl() -> Duration {
        Duration::minutes(10)
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = open_file(path.as_ref())?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = open_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Issue a fresh state for `owner_id` linking `channel`.
    pub fn issue(
        &self,
        link: &PendingLink,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<String, StoreError> {
        let state = Uuid::new_v4().simple().to_string();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO oauth_states (state, owner_id, channel, redirect_uri, expires_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                state,
                link.owner_id,
                link.channel,
                link.redirect_uri,
                format_ts(now + ttl),
                format_ts(now),
            ],
        )?;
        debug!(owner_id = %link.owner_id, channel = %link.channel, "oauth state issued");
        Ok(state)
    }

    /// Consume a state. A state can be consumed once; expired states are
    /// removed and reported as absent.
    pub fn consume(&self, state: &str, now: DateTime<Utc>) -> Result<Option<PendingLink>, StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let found = tx
            .query_row(
                "SELECT owner_id, channel, redirect_uri, expires_at > ?2
                 FROM oauth_states WHERE state = ?1",
                params![state, format_ts(now)],
                |row| {
                    Ok((
                        PendingLink {
                            owner_id: row.get(0)?,
                            channel: row.get(1)?,
                            redirect_uri: row.get(2)?,
                        },
                        row.get::<_, bool>(3)?,
                    ))
                },
            )
            .optional()?;
        tx.execute("DELETE FROM oauth_states WHERE state = ?1", params![state])?;
        tx.commit()?;

        Ok(found.and_then(|(link, live)| live.then_some(link)))
    }

    /// Delete every expired state. Returns how many were removed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let conn = self.conn.lock().unwrap();
        let purged = conn.execute(
            "DELETE FROM oauth_states WHERE expires_at <= ?1",
            params![format_ts(now)],
        )?;
        Ok(purged)
    }
}
