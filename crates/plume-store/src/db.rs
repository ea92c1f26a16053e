//! SQLite store for posts and their publish attempts.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{Connection, Row, TransactionBehavior, params, params_from_iter};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::StoreError;
use crate::sqlite::{OptionalExt, json_col, open_file, open_memory, opt_ts_col, ts_col};
use crate::time::format_ts;
use crate::types::{
    NewPost, Page, Post, PostFilter, PostPatch, PublishAttempt, PublishStatus, Scope, roll_up,
};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS posts (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        owner_id TEXT NOT NULL,
        content TEXT,
        media TEXT NOT NULL DEFAULT '[]',
        channels TEXT NOT NULL,
        scheduled_at TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        error TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_posts_scope ON posts(tenant_id, owner_id, scheduled_at);
    CREATE INDEX IF NOT EXISTS idx_posts_status ON posts(status, scheduled_at);

    CREATE TABLE IF NOT EXISTS publish_attempts (
        id TEXT PRIMARY KEY,
        post_id TEXT NOT NULL REFERENCES posts(id),
        channel TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        published_at TEXT,
        external_id TEXT,
        error TEXT,
        claimed_until TEXT,
        updated_at TEXT NOT NULL,
        UNIQUE (post_id, channel)
    );
    CREATE INDEX IF NOT EXISTS idx_attempts_status ON publish_attempts(status);
";

const POST_COLUMNS: &str = "id, tenant_id, owner_id, content, media, channels, scheduled_at, \
                            status, error, created_at, updated_at";

const ATTEMPT_COLUMNS: &str = "id, post_id, channel, status, published_at, external_id, error, \
                               claimed_until, updated_at";

/// SQLite-backed record of posts and publish attempts.
///
/// All multi-row transitions run in one `BEGIN IMMEDIATE` transaction, so a
/// post's aggregate status is always consistent with its attempts.
pub struct PostStore {
    conn: Mutex<Connection>,
}

/// Outcome of trying to claim an attempt for delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimResult {
    /// The caller now holds the attempt until the requested expiry.
    Claimed,
    /// Another worker holds an unexpired claim.
    InFlight { until: DateTime<Utc> },
    /// The attempt is no longer pending.
    Resolved(PublishStatus),
    /// The attempt no longer exists.
    Missing,
}

/// Outcome of writing a delivery result.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    /// The attempt was pending and now holds the result. Carries the post
    /// after roll-up.
    Recorded(Post),
    /// The attempt left `pending` while the delivery was in flight.
    Stale,
}

/// Result of editing a pending post.
#[derive(Debug, Clone)]
pub struct PostUpdate {
    pub post: Post,
    /// Channels that gained a new pending attempt.
    pub added: Vec<String>,
    /// Channels whose pending attempt was dropped.
    pub removed: Vec<String>,
    /// True when the scheduled time moved earlier.
    pub moved_earlier: bool,
    /// Channels whose attempt is still pending after the edit.
    pub pending: Vec<String>,
}

impl PostStore {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = open_file(path)?;
        conn.execute_batch(SCHEMA)?;

        info!(path = %path.display(), "post store initialized");

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

    // =========================================================================
    // Orchestrator operations
    // =========================================================================

    /// Create a pending post with one pending attempt per channel.
    pub fn insert_post(
        &self,
        new: NewPost,
        now: DateTime<Utc>,
    ) -> Result<(Post, Vec<PublishAttempt>), StoreError> {
        let post = Post {
            id: Uuid::new_v4().to_string(),
            tenant_id: new.scope.tenant_id,
            owner_id: new.scope.owner_id,
            content: new.content,
            media: new.media,
            channels: new.channels,
            scheduled_at: new.scheduled_at,
            status: PublishStatus::Pending,
            error: None,
            created_at: now,
            updated_at: now,
        };

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO posts
             (id, tenant_id, owner_id, content, media, channels, scheduled_at, status, error, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL, ?9, ?9)",
            params![
                post.id,
                post.tenant_id,
                post.owner_id,
                post.content,
                serde_json::to_string(&post.media)?,
                serde_json::to_string(&post.channels)?,
                format_ts(post.scheduled_at),
                post.status,
                format_ts(now),
            ],
        )?;

        let mut attempts = Vec::with_capacity(post.channels.len());
        for channel in &post.channels {
            attempts.push(insert_attempt(&tx, &post.id, channel, now)?);
        }
        tx.commit()?;

        debug!(post_id = %post.id, channels = attempts.len(), "post created");
        Ok((post, attempts))
    }

    /// Get a post visible to `scope`.
    pub fn get_post(&self, scope: &Scope, id: &str) -> Result<Post, StoreError> {
        let conn = self.conn.lock().unwrap();
        scoped_post(&conn, scope, id)
    }

    /// List posts visible to `scope`, newest scheduled time first.
    pub fn list_posts(&self, scope: &Scope, filter: &PostFilter) -> Result<Page<Post>, StoreError> {
        let mut clauses = vec!["tenant_id = ?", "owner_id = ?"];
        let mut args = vec![
            Value::Text(scope.tenant_id.clone()),
            Value::Text(scope.owner_id.clone()),
        ];
        if let Some(status) = filter.status {
            clauses.push("status = ?");
            args.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(from) = filter.from {
            clauses.push("scheduled_at >= ?");
            args.push(Value::Text(format_ts(from)));
        }
        if let Some(to) = filter.to {
            clauses.push("scheduled_at <= ?");
            args.push(Value::Text(format_ts(to)));
        }
        let where_clause = clauses.join(" AND ");

        let conn = self.conn.lock().unwrap();
        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM posts WHERE {where_clause}"),
            params_from_iter(args.iter()),
            |row| row.get(0),
        )?;

        let (limit, offset) = filter.limit_offset();
        args.push(Value::Integer(limit));
        args.push(Value::Integer(offset));

        let mut stmt = conn.prepare(&format!(
            "SELECT {POST_COLUMNS} FROM posts WHERE {where_clause}
             ORDER BY scheduled_at DESC, id LIMIT ? OFFSET ?"
        ))?;
        let items = stmt
            .query_map(params_from_iter(args.iter()), post_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Page {
            items,
            total: total as u64,
            page: filter.page.max(1),
            page_size: limit as u32,
        })
    }

    /// List the attempts of a post visible to `scope`, ordered by channel.
    pub fn list_attempts(
        &self,
        scope: &Scope,
        post_id: &str,
    ) -> Result<Vec<PublishAttempt>, StoreError> {
        let conn = self.conn.lock().unwrap();
        scoped_post(&conn, scope, post_id)?;
        Ok(attempts_for(&conn, post_id)?)
    }

    /// Cancel a pending post and every attempt that is still pending.
    ///
    /// Attempts that already published or failed are left as they are.
    pub fn cancel_post(
        &self,
        scope: &Scope,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<(Post, Vec<PublishAttempt>), StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let post = scoped_post(&tx, scope, id)?;
        require_pending(&post)?;

        let ts = format_ts(now);
        let canceled = tx.execute(
            "UPDATE publish_attempts SET status = 'canceled', claimed_until = NULL, updated_at = ?1
             WHERE post_id = ?2 AND status = 'pending'",
            params![ts, id],
        )?;
        tx.execute(
            "UPDATE posts SET status = 'canceled', updated_at = ?1 WHERE id = ?2",
            params![ts, id],
        )?;

        let post = load_post(&tx, id)?;
        let attempts = attempts_for(&tx, id)?;
        tx.commit()?;

        debug!(post_id = %id, canceled, "post canceled");
        Ok((post, attempts))
    }

    /// Delete a pending post together with all of its attempts.
    pub fn delete_post(&self, scope: &Scope, id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let post = scoped_post(&tx, scope, id)?;
        require_pending(&post)?;

        tx.execute("DELETE FROM publish_attempts WHERE post_id = ?1", params![id])?;
        tx.execute("DELETE FROM posts WHERE id = ?1", params![id])?;
        tx.commit()?;

        debug!(post_id = %id, "post deleted");
        Ok(())
    }

    /// Bring a pending post's schedule forward to `now`.
    ///
    /// Returns the post and the channels whose attempt is still pending.
    pub fn publish_now(
        &self,
        scope: &Scope,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<(Post, Vec<String>), StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut post = scoped_post(&tx, scope, id)?;
        require_pending(&post)?;

        if post.scheduled_at > now {
            tx.execute(
                "UPDATE posts SET scheduled_at = ?1, updated_at = ?1 WHERE id = ?2",
                params![format_ts(now), id],
            )?;
            post.scheduled_at = now;
            post.updated_at = now;
        }

        let pending = pending_channels(&tx, id)?;
        tx.commit()?;
        Ok((post, pending))
    }

    /// Edit a pending post in place.
    ///
    /// A new channel list recomputes the attempt set: pending attempts for
    /// dropped channels are deleted, resolved ones are kept, and new channels
    /// get a fresh pending attempt.
    pub fn update_post(
        &self,
        scope: &Scope,
        id: &str,
        patch: PostPatch,
        now: DateTime<Utc>,
    ) -> Result<PostUpdate, StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut post = scoped_post(&tx, scope, id)?;
        require_pending(&post)?;

        if let Some(content) = patch.content {
            // Blank text clears it
            post.content = Some(content).filter(|c| !c.trim().is_empty());
        }
        if let Some(media) = patch.media {
            post.media = media;
        }
        if post.content.is_none() && post.media.is_empty() {
            return Err(StoreError::EmptyPost);
        }
        let mut moved_earlier = false;
        if let Some(at) = patch.scheduled_at {
            moved_earlier = at < post.scheduled_at;
            post.scheduled_at = at;
        }

        let mut added = Vec::new();
        let mut removed = Vec::new();
        if let Some(channels) = patch.channels {
            let existing = attempts_for(&tx, id)?;
            for attempt in &existing {
                if attempt.status == PublishStatus::Pending && !channels.contains(&attempt.channel) {
                    tx.execute(
                        "DELETE FROM publish_attempts WHERE id = ?1",
                        params![attempt.id],
                    )?;
                    removed.push(attempt.channel.clone());
                }
            }
            for channel in &channels {
                if !existing.iter().any(|a| &a.channel == channel) {
                    insert_attempt(&tx, id, channel, now)?;
                    added.push(channel.clone());
                }
            }
            post.channels = channels;
        }

        tx.execute(
            "UPDATE posts SET content = ?1, media = ?2, channels = ?3, scheduled_at = ?4, updated_at = ?5
             WHERE id = ?6",
            params![
                post.content,
                serde_json::to_string(&post.media)?,
                serde_json::to_string(&post.channels)?,
                format_ts(post.scheduled_at),
                format_ts(now),
                id,
            ],
        )?;

        // Dropping the last pending channel can resolve the post
        let post = settle_post(&tx, id, None, now)?;
        let pending = pending_channels(&tx, id)?;
        tx.commit()?;

        debug!(
            post_id = %id,
            added = added.len(),
            removed = removed.len(),
            moved_earlier,
            "post updated"
        );
        Ok(PostUpdate {
            post,
            added,
            removed,
            moved_earlier,
            pending,
        })
    }

    /// Reset a failed (or still pending) attempt and its post to `pending`.
    pub fn reset_attempt_for_retry(
        &self,
        scope: &Scope,
        post_id: &str,
        attempt_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(Post, PublishAttempt), StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let post = scoped_post(&tx, scope, post_id)?;
        if post.status == PublishStatus::Canceled {
            return Err(StoreError::InvalidState {
                entity: "post",
                expected: "pending or error",
                actual: post.status,
            });
        }

        let attempt = tx
            .query_row(
                &format!("SELECT {ATTEMPT_COLUMNS} FROM publish_attempts WHERE id = ?1 AND post_id = ?2"),
                params![attempt_id, post_id],
                attempt_from_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::AttemptNotFound(attempt_id.to_string()))?;
        if !matches!(attempt.status, PublishStatus::Error | PublishStatus::Pending) {
            return Err(StoreError::InvalidState {
                entity: "publish attempt",
                expected: "error or pending",
                actual: attempt.status,
            });
        }

        let ts = format_ts(now);
        tx.execute(
            "UPDATE publish_attempts SET status = 'pending', error = NULL, updated_at = ?1 WHERE id = ?2",
            params![ts, attempt_id],
        )?;
        tx.execute(
            "UPDATE posts SET status = 'pending', error = NULL, updated_at = ?1 WHERE id = ?2",
            params![ts, post_id],
        )?;

        let post = load_post(&tx, post_id)?;
        let attempt = tx.query_row(
            &format!("SELECT {ATTEMPT_COLUMNS} FROM publish_attempts WHERE id = ?1"),
            params![attempt_id],
            attempt_from_row,
        )?;
        tx.commit()?;

        debug!(post_id = %post_id, channel = %attempt.channel, "attempt reset for retry");
        Ok((post, attempt))
    }

    // =========================================================================
    // Worker operations
    // =========================================================================

    /// Look up a post by id regardless of scope.
    pub fn find_post(&self, id: &str) -> Result<Option<Post>, StoreError> {
        let conn = self.conn.lock().unwrap();
        Ok(find_post(&conn, id)?)
    }

    /// Look up the attempt for a (post, channel) pair.
    pub fn find_attempt(
        &self,
        post_id: &str,
        channel: &str,
    ) -> Result<Option<PublishAttempt>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let attempt = conn
            .query_row(
                &format!(
                    "SELECT {ATTEMPT_COLUMNS} FROM publish_attempts WHERE post_id = ?1 AND channel = ?2"
                ),
                params![post_id, channel],
                attempt_from_row,
            )
            .optional()?;
        Ok(attempt)
    }

    /// Claim a pending attempt until `until`, unless another claim is live.
    pub fn claim_attempt(
        &self,
        attempt_id: &str,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ClaimResult, StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = tx
            .query_row(
                "SELECT status, claimed_until FROM publish_attempts WHERE id = ?1",
                params![attempt_id],
                |row| Ok((row.get::<_, PublishStatus>(0)?, opt_ts_col(row, 1)?)),
            )
            .optional()?;

        let result = match current {
            None => ClaimResult::Missing,
            Some((status, _)) if status != PublishStatus::Pending => ClaimResult::Resolved(status),
            Some((_, Some(held))) if held > now => ClaimResult::InFlight { until: held },
            Some(_) => {
                tx.execute(
                    "UPDATE publish_attempts SET claimed_until = ?1, updated_at = ?2 WHERE id = ?3",
                    params![format_ts(until), format_ts(now), attempt_id],
                )?;
                ClaimResult::Claimed
            }
        };
        tx.commit()?;
        Ok(result)
    }

    /// Drop a claim so the next delivery of the attempt can proceed.
    pub fn release_claim(&self, attempt_id: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE publish_attempts SET claimed_until = NULL, updated_at = ?1
             WHERE id = ?2 AND status = 'pending'",
            params![format_ts(now), attempt_id],
        )?;
        Ok(())
    }

    /// Mark a pending attempt published and roll up its post.
    pub fn record_success(
        &self,
        attempt_id: &str,
        external_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<RecordOutcome, StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let changed = tx.execute(
            "UPDATE publish_attempts
             SET status = 'published', published_at = ?1, external_id = ?2, error = NULL,
                 claimed_until = NULL, updated_at = ?1
             WHERE id = ?3 AND status = 'pending'",
            params![format_ts(now), external_id, attempt_id],
        )?;
        if changed == 0 {
            return Ok(RecordOutcome::Stale);
        }

        let post_id: String = tx.query_row(
            "SELECT post_id FROM publish_attempts WHERE id = ?1",
            params![attempt_id],
            |row| row.get(0),
        )?;
        let post = settle_post(&tx, &post_id, None, now)?;
        tx.commit()?;
        Ok(RecordOutcome::Recorded(post))
    }

    /// Mark a pending attempt failed and roll up its post.
    ///
    /// The post's error message names the failing channel.
    pub fn record_failure(
        &self,
        attempt_id: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<RecordOutcome, StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let changed = tx.execute(
            "UPDATE publish_attempts
             SET status = 'error', error = ?1, claimed_until = NULL, updated_at = ?2
             WHERE id = ?3 AND status = 'pending'",
            params![message, format_ts(now), attempt_id],
        )?;
        if changed == 0 {
            return Ok(RecordOutcome::Stale);
        }

        let (post_id, channel): (String, String) = tx.query_row(
            "SELECT post_id, channel FROM publish_attempts WHERE id = ?1",
            params![attempt_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let post = settle_post(&tx, &post_id, Some(format!("{}: {}", channel, message)), now)?;
        tx.commit()?;
        Ok(RecordOutcome::Recorded(post))
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// Pending attempts of pending posts scheduled at or before `cutoff` that
    /// nobody holds a live claim on.
    pub fn stranded_attempts(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<PublishAttempt>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT a.id, a.post_id, a.channel, a.status, a.published_at, a.external_id, a.error,
                    a.claimed_until, a.updated_at
             FROM publish_attempts a JOIN posts p ON p.id = a.post_id
             WHERE a.status = 'pending' AND p.status = 'pending' AND p.scheduled_at <= ?1
               AND (a.claimed_until IS NULL OR a.claimed_until <= ?2)
             ORDER BY p.scheduled_at, a.channel",
        )?;
        let attempts = stmt
            .query_map(params![format_ts(cutoff), format_ts(now)], attempt_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(attempts)
    }

    /// Re-derive every pending post whose attempts are all resolved.
    ///
    /// Returns the posts whose status changed.
    pub fn settle_unresolved(&self, now: DateTime<Utc>) -> Result<Vec<Post>, StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let ids = {
            let mut stmt = tx.prepare(
                "SELECT p.id FROM posts p
                 WHERE p.status = 'pending'
                   AND EXISTS (SELECT 1 FROM publish_attempts a WHERE a.post_id = p.id)
                   AND NOT EXISTS (
                       SELECT 1 FROM publish_attempts a WHERE a.post_id = p.id AND a.status = 'pending'
                   )",
            )?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            ids
        };

        let mut settled = Vec::new();
        for id in ids {
            let post = settle_post(&tx, &id, None, now)?;
            if post.status != PublishStatus::Pending {
                settled.push(post);
            }
        }
        tx.commit()?;
        Ok(settled)
    }
}

// =============================================================================
// Row helpers
// =============================================================================

fn post_from_row(row: &Row<'_>) -> rusqlite::Result<Post> {
    Ok(Post {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        owner_id: row.get(2)?,
        content: row.get(3)?,
        media: json_col(row, 4)?,
        channels: json_col(row, 5)?,
        scheduled_at: ts_col(row, 6)?,
        status: row.get(7)?,
        error: row.get(8)?,
        created_at: ts_col(row, 9)?,
        updated_at: ts_col(row, 10)?,
    })
}

fn attempt_from_row(row: &Row<'_>) -> rusqlite::Result<PublishAttempt> {
    Ok(PublishAttempt {
        id: row.get(0)?,
        post_id: row.get(1)?,
        channel: row.get(2)?,
        status: row.get(3)?,
        published_at: opt_ts_col(row, 4)?,
        external_id: row.get(5)?,
        error: row.get(6)?,
        claimed_until: opt_ts_col(row, 7)?,
        updated_at: ts_col(row, 8)?,
    })
}

fn find_post(conn: &Connection, id: &str) -> Result<Option<Post>, rusqlite::Error> {
    conn.query_row(
        &format!("SELECT {POST_COLUMNS} FROM posts WHERE id = ?1"),
        params![id],
        post_from_row,
    )
    .optional()
}

fn load_post(conn: &Connection, id: &str) -> Result<Post, StoreError> {
    find_post(conn, id)?.ok_or_else(|| StoreError::PostNotFound(id.to_string()))
}

fn scoped_post(conn: &Connection, scope: &Scope, id: &str) -> Result<Post, StoreError> {
    conn.query_row(
        &format!("SELECT {POST_COLUMNS} FROM posts WHERE id = ?1 AND tenant_id = ?2 AND owner_id = ?3"),
        params![id, scope.tenant_id, scope.owner_id],
        post_from_row,
    )
    .optional()?
    .ok_or_else(|| StoreError::PostNotFound(id.to_string()))
}

fn require_pending(post: &Post) -> Result<(), StoreError> {
    if post.status == PublishStatus::Pending {
        Ok(())
    } else {
        Err(StoreError::InvalidState {
            entity: "post",
            expected: "pending",
            actual: post.status,
        })
    }
}

fn attempts_for(conn: &Connection, post_id: &str) -> Result<Vec<PublishAttempt>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ATTEMPT_COLUMNS} FROM publish_attempts WHERE post_id = ?1 ORDER BY channel"
    ))?;
    let attempts = stmt
        .query_map(params![post_id], attempt_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(attempts)
}

fn pending_channels(conn: &Connection, post_id: &str) -> Result<Vec<String>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT channel FROM publish_attempts WHERE post_id = ?1 AND status = 'pending' ORDER BY channel",
    )?;
    let channels = stmt
        .query_map(params![post_id], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(channels)
}

fn insert_attempt(
    conn: &Connection,
    post_id: &str,
    channel: &str,
    now: DateTime<Utc>,
) -> Result<PublishAttempt, StoreError> {
    let attempt = PublishAttempt {
        id: Uuid::new_v4().to_string(),
        post_id: post_id.to_string(),
        channel: channel.to_string(),
        status: PublishStatus::Pending,
        published_at: None,
        external_id: None,
        error: None,
        claimed_until: None,
        updated_at: now,
    };
    conn.execute(
        "INSERT INTO publish_attempts (id, post_id, channel, status, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            attempt.id,
            attempt.post_id,
            attempt.channel,
            attempt.status,
            format_ts(now)
        ],
    )?;
    Ok(attempt)
}

/// Recompute a post's status from its attempts and persist any change.
///
/// `failure` becomes the post's error message when the result is `error`;
/// otherwise an existing message is kept for `error` and cleared for
/// `pending` and `published`.
fn settle_post(
    conn: &Connection,
    post_id: &str,
    failure: Option<String>,
    now: DateTime<Utc>,
) -> Result<Post, StoreError> {
    let mut post = load_post(conn, post_id)?;

    let statuses = {
        let mut stmt = conn.prepare("SELECT status FROM publish_attempts WHERE post_id = ?1")?;
        let statuses = stmt
            .query_map(params![post_id], |row| row.get::<_, PublishStatus>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        statuses
    };
    let status = roll_up(post.status, statuses);
    let error = match status {
        PublishStatus::Error => failure.or_else(|| post.error.clone()),
        PublishStatus::Canceled => post.error.clone(),
        PublishStatus::Pending | PublishStatus::Published => None,
    };

    if status != post.status || error != post.error {
        conn.execute(
            "UPDATE posts SET status = ?1, error = ?2, updated_at = ?3 WHERE id = ?4",
            params![status, error, format_ts(now), post_id],
        )?;
        debug!(post_id = %post_id, from = %post.status, to = %status, "post rolled up");
        post.status = status;
        post.error = error;
        post.updated_at = now;
    }
    Ok(post)
}
