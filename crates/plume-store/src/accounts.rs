//! Linked channel accounts.
//!
//! One row per (owner, channel) holding the access material a provider needs
//! to publish on the owner's behalf. The publishing pipeline only reads it.

use std::fmt;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row, params};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::sqlite::{OptionalExt, open_file, open_memory, opt_ts_col, ts_col};
use crate::time::format_ts;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS linked_accounts (
        owner_id TEXT NOT NULL,
        channel TEXT NOT NULL,
        account_id TEXT NOT NULL,
        access_token TEXT NOT NULL,
        refresh_token TEXT,
        secret TEXT,
        expires_at TEXT,
        linked_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (owner_id, channel)
    );
";

/// Access material for one channel account.
#[derive(Clone, PartialEq)]
pub struct LinkedAccount {
    pub owner_id: String,
    pub channel: String,
    /// Channel-side identity: a DID, person URN, business account id or URL.
    pub account_id: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Signing secret for channels that sign requests.
    pub secret: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub linked_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LinkedAccount {
    /// True once `expires_at` has passed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

// Tokens never reach logs through Debug
impl fmt::Debug for LinkedAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkedAccount")
            .field("owner_id", &self.owner_id)
            .field("channel", &self.channel)
            .field("account_id", &self.account_id)
            .field("access_token", &"[redacted]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[redacted]"))
            .field("secret", &self.secret.as_ref().map(|_| "[redacted]"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// SQLite-backed linked account table.
pub struct AccountStore {
    conn: Mutex<Connection>,
}

impl AccountStore {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = open_file(path)?;
        conn.execute_batch(SCHEMA)?;

        info!(path = %path.display(), "account store initialized");

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = open_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Link an account, replacing any previous link for the same channel.
    pub fn link(&self, account: &LinkedAccount) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO linked_accounts
             (owner_id, channel, account_id, access_token, refresh_token, secret, expires_at, linked_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT (owner_id, channel) DO UPDATE SET
                account_id = excluded.account_id,
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                secret = excluded.secret,
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at",
            params![
                account.owner_id,
                account.channel,
                account.account_id,
                account.access_token,
                account.refresh_token,
                account.secret,
                account.expires_at.map(format_ts),
                format_ts(account.linked_at),
                format_ts(account.updated_at),
            ],
        )?;

        debug!(owner_id = %account.owner_id, channel = %account.channel, "account linked");
        Ok(())
    }

    /// Remove a link. Returns false if there was none.
    pub fn unlink(&self, owner_id: &str, channel: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute(
            "DELETE FROM linked_accounts WHERE owner_id = ?1 AND channel = ?2",
            params![owner_id, channel],
        )?;
        Ok(removed > 0)
    }

    /// Get the account linked for (owner, channel).
    pub fn get(&self, owner_id: &str, channel: &str) -> Result<Option<LinkedAccount>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let account = conn
            .query_row(
                "SELECT owner_id, channel, account_id, access_token, refresh_token, secret,
                        expires_at, linked_at, updated_at
                 FROM linked_accounts WHERE owner_id = ?1 AND channel = ?2",
                params![owner_id, channel],
                account_from_row,
            )
            .optional()?;
        Ok(account)
    }

    /// List every account linked by an owner.
    pub fn list(&self, owner_id: &str) -> Result<Vec<LinkedAccount>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT owner_id, channel, account_id, access_token, refresh_token, secret,
                    expires_at, linked_at, updated_at
             FROM linked_accounts WHERE owner_id = ?1 ORDER BY channel",
        )?;
        let accounts = stmt
            .query_map(params![owner_id], account_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(accounts)
    }
}

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<LinkedAccount> {
    Ok(LinkedAccount {
        owner_id: row.get(0)?,
        channel: row.get(1)?,
        account_id: row.get(2)?,
        access_token: row.get(3)?,
        refresh_token: row.get(4)?,
        secret: row.get(5)?,
        expires_at: opt_ts_col(row, 6)?,
        linked_at: ts_col(row, 7)?,
        updated_at: ts_col(row, 8)?,
    })
}
