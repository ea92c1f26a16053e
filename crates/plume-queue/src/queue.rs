//! SQLite-backed job queue.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, Row, TransactionBehavior, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    FailOutcome, Job, JobHandle, JobStatus, NewJob, QueueConfig, QueueError, QueueStats,
    RetryPolicy,
};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS jobs (
        id TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        key TEXT,
        payload TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'queued',
        run_at INTEGER NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL,
        base_delay_ms INTEGER NOT NULL,
        max_delay_ms INTEGER NOT NULL,
        last_error TEXT,
        lease_owner TEXT,
        lease_expires_at INTEGER,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_jobs_due ON jobs(status, run_at);
    CREATE INDEX IF NOT EXISTS idx_jobs_key ON jobs(kind, key, status);
";

const JOB_COLUMNS: &str = "id, kind, key, payload, status, run_at, attempts, max_attempts, \
                           base_delay_ms, max_delay_ms, last_error, lease_owner, lease_expires_at, \
                           created_at, updated_at";

/// How long a writer waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Durable delayed job queue.
///
/// Any number of workers, in this process or others sharing the database
/// file, may claim from the same queue. A claim is a lease: the job stays
/// invisible until it is completed, failed, or the lease lapses.
pub struct JobQueue {
    conn: Mutex<Connection>,
    config: QueueConfig,
}

impl JobQueue {
    /// Open or create the queue at `path`.
    pub fn open(path: impl AsRef<Path>, config: QueueConfig) -> Result<Self, QueueError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;

        // Enable WAL mode for concurrent reads
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;

        info!(path = %path.display(), "job queue initialized");

        Ok(Self {
            conn: Mutex::new(conn),
            config,
        })
    }

    /// Open a private in-memory queue.
    pub fn open_in_memory(config: QueueConfig) -> Result<Self, QueueError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            config,
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Admit a job, invisible to consumers until `now + delay`.
    pub fn enqueue(&self, job: NewJob, now: DateTime<Utc>) -> Result<JobHandle, QueueError> {
        let id = Uuid::new_v4().to_string();
        let retry = job.retry.unwrap_or(self.config.retry);
        let run_at = now + chrono::Duration::from_std(job.delay).unwrap_or(chrono::Duration::zero());

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO jobs
             (id, kind, key, payload, status, run_at, attempts, max_attempts, base_delay_ms, max_delay_ms,
              created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'queued', ?5, 0, ?6, ?7, ?8, ?9, ?9)",
            params![
                id,
                job.kind,
                job.key,
                serde_json::to_string(&job.payload)?,
                run_at.timestamp_millis(),
                retry.max_attempts,
                retry.base_delay.as_millis() as i64,
                retry.max_delay.as_millis() as i64,
                now.timestamp_millis(),
            ],
        )?;

        debug!(job_id = %id, kind = %job.kind, key = ?job.key, %run_at, "job enqueued");
        Ok(JobHandle { id, run_at })
    }

    /// Lease the next due job to `worker`.
    ///
    /// Jobs whose lease lapsed are eligible again as long as they have
    /// attempts left; see [`JobQueue::reap_expired`] for the rest.
    pub fn claim(&self, worker: &str, now: DateTime<Utc>) -> Result<Option<Job>, QueueError> {
        let now_ms = now.timestamp_millis();
        let lease_ms = self.config.lease_duration.as_millis() as i64;

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let candidate: Option<String> = tx
            .query_row(
                "SELECT id FROM jobs
                 WHERE (status = 'queued' AND run_at <= ?1)
                    OR (status = 'leased' AND lease_expires_at <= ?1 AND attempts < max_attempts)
                 ORDER BY run_at, created_at
                 LIMIT 1",
                params![now_ms],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                e => Err(e),
            })?;

        let Some(id) = candidate else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE jobs SET status = 'leased', attempts = attempts + 1, lease_owner = ?1,
                 lease_expires_at = ?2, updated_at = ?3
             WHERE id = ?4",
            params![worker, now_ms + lease_ms, now_ms, id],
        )?;
        let job = load_job(&tx, &id)?;
        tx.commit()?;

        debug!(job_id = %job.id, kind = %job.kind, attempt = job.attempts, worker, "job leased");
        Ok(Some(job))
    }

    /// Dead-letter leased jobs whose lease lapsed on their final attempt.
    pub fn reap_expired(&self, now: DateTime<Utc>) -> Result<Vec<Job>, QueueError> {
        let now_ms = now.timestamp_millis();
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let ids = {
            let mut stmt = tx.prepare(
                "SELECT id FROM jobs
                 WHERE status = 'leased' AND lease_expires_at <= ?1 AND attempts >= max_attempts",
            )?;
            let ids = stmt
                .query_map(params![now_ms], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            ids
        };

        let mut reaped = Vec::with_capacity(ids.len());
        for id in ids {
            tx.execute(
                "UPDATE jobs SET status = 'dead', lease_owner = NULL, lease_expires_at = NULL,
                     last_error = COALESCE(last_error, 'lease expired'), updated_at = ?1
                 WHERE id = ?2",
                params![now_ms, id],
            )?;
            reaped.push(load_job(&tx, &id)?);
        }
        tx.commit()?;

        for job in &reaped {
            warn!(job_id = %job.id, kind = %job.kind, attempts = job.attempts, "lease expired on final attempt, job dead-lettered");
        }
        Ok(reaped)
    }

    /// Acknowledge a leased job. Returns false if `worker` no longer held it.
    pub fn complete(&self, job_id: &str, worker: &str, now: DateTime<Utc>) -> Result<bool, QueueError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE jobs SET status = 'completed', lease_owner = NULL, lease_expires_at = NULL,
                 updated_at = ?1
             WHERE id = ?2 AND status = 'leased' AND lease_owner = ?3",
            params![now.timestamp_millis(), job_id, worker],
        )?;
        Ok(changed > 0)
    }

    /// Report a failed delivery: requeue with backoff or dead-letter.
    pub fn fail(
        &self,
        job_id: &str,
        worker: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, QueueError> {
        let now_ms = now.timestamp_millis();
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let job = load_job(&tx, job_id)?;
        if job.status != JobStatus::Leased || job.lease_owner.as_deref() != Some(worker) {
            return Ok(FailOutcome::LeaseLost);
        }

        let outcome = if job.is_final_attempt() {
            tx.execute(
                "UPDATE jobs SET status = 'dead', last_error = ?1, lease_owner = NULL,
                     lease_expires_at = NULL, updated_at = ?2
                 WHERE id = ?3",
                params![error, now_ms, job_id],
            )?;
            FailOutcome::Dead(load_job(&tx, job_id)?)
        } else {
            let delay = job.retry.delay_for(job.attempts);
            let run_at = now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
            tx.execute(
                "UPDATE jobs SET status = 'queued', run_at = ?1, last_error = ?2, lease_owner = NULL,
                     lease_expires_at = NULL, updated_at = ?3
                 WHERE id = ?4",
                params![run_at.timestamp_millis(), error, now_ms, job_id],
            )?;
            FailOutcome::Retrying { run_at }
        };
        tx.commit()?;

        match &outcome {
            FailOutcome::Retrying { run_at } => {
                debug!(job_id, attempt = job.attempts, %run_at, error, "job failed, retry scheduled");
            }
            FailOutcome::Dead(_) => {
                warn!(job_id, attempts = job.attempts, error, "job failed on final attempt, dead-lettered");
            }
            FailOutcome::LeaseLost => {}
        }
        Ok(outcome)
    }

    /// True if a queued or leased job of `kind` carries `key`.
    pub fn has_live_job(&self, kind: &str, key: &str) -> Result<bool, QueueError> {
        let conn = self.conn.lock().unwrap();
        let live: bool = conn.query_row(
            "SELECT EXISTS (
                 SELECT 1 FROM jobs WHERE kind = ?1 AND key = ?2 AND status IN ('queued', 'leased')
             )",
            params![kind, key],
            |row| row.get(0),
        )?;
        Ok(live)
    }

    /// Get a job by id.
    pub fn get(&self, job_id: &str) -> Result<Option<Job>, QueueError> {
        let conn = self.conn.lock().unwrap();
        match load_job(&conn, job_id) {
            Ok(job) => Ok(Some(job)),
            Err(QueueError::JobNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Most recently dead-lettered jobs first.
    pub fn dead_letters(&self, limit: usize) -> Result<Vec<Job>, QueueError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status = 'dead' ORDER BY updated_at DESC LIMIT ?1"
        ))?;
        let jobs = stmt
            .query_map(params![limit as i64], job_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    /// Put a dead job back in the queue with a fresh retry budget.
    pub fn requeue_dead(&self, job_id: &str, now: DateTime<Utc>) -> Result<JobHandle, QueueError> {
        let now_ms = now.timestamp_millis();
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE jobs SET status = 'queued', attempts = 0, run_at = ?1, updated_at = ?1
             WHERE id = ?2 AND status = 'dead'",
            params![now_ms, job_id],
        )?;
        if changed == 0 {
            return Err(QueueError::JobNotFound(job_id.to_string()));
        }

        info!(job_id, "dead job requeued");
        Ok(JobHandle {
            id: job_id.to_string(),
            run_at: now,
        })
    }

    /// Job counts by status.
    pub fn stats(&self) -> Result<QueueStats, QueueError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            let count = count as u64;
            match status.parse::<JobStatus>().map_err(QueueError::Corrupt)? {
                JobStatus::Queued => stats.queued = count,
                JobStatus::Leased => stats.leased = count,
                JobStatus::Completed => stats.completed = count,
                JobStatus::Dead => stats.dead = count,
            }
        }
        Ok(stats)
    }

    /// Drop completed and dead jobs beyond the configured retention.
    pub fn prune(&self) -> Result<usize, QueueError> {
        let conn = self.conn.lock().unwrap();
        let mut removed = 0;
        for (status, keep) in [
            (JobStatus::Completed, self.config.keep_completed),
            (JobStatus::Dead, self.config.keep_dead),
        ] {
            removed += conn.execute(
                "DELETE FROM jobs WHERE status = ?1 AND id NOT IN (
                     SELECT id FROM jobs WHERE status = ?1 ORDER BY updated_at DESC LIMIT ?2
                 )",
                params![status.as_str(), keep as i64],
            )?;
        }
        if removed > 0 {
            debug!(removed, "pruned finished jobs");
        }
        Ok(removed)
    }

    /// Earliest moment a job could become claimable.
    pub fn next_wakeup(&self) -> Result<Option<DateTime<Utc>>, QueueError> {
        let conn = self.conn.lock().unwrap();
        let next: Option<i64> = conn.query_row(
            "SELECT MIN(t) FROM (
                 SELECT MIN(run_at) AS t FROM jobs WHERE status = 'queued'
                 UNION ALL
                 SELECT MIN(lease_expires_at) AS t FROM jobs WHERE status = 'leased'
             )",
            [],
            |row| row.get(0),
        )?;
        Ok(next.and_then(DateTime::from_timestamp_millis))
    }
}

fn load_job(conn: &Connection, id: &str) -> Result<Job, QueueError> {
    conn.query_row(
        &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
        params![id],
        job_from_row,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => QueueError::JobNotFound(id.to_string()),
        e => QueueError::Sqlite(e),
    })
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    let payload: String = row.get(3)?;
    let status: String = row.get(4)?;
    Ok(Job {
        id: row.get(0)?,
        kind: row.get(1)?,
        key: row.get(2)?,
        payload: serde_json::from_str(&payload).map_err(|e| bad_column(3, e.to_string()))?,
        status: status.parse().map_err(|e| bad_column(4, e))?,
        run_at: ms_col(row, 5)?,
        attempts: row.get(6)?,
        retry: RetryPolicy {
            max_attempts: row.get(7)?,
            base_delay: Duration::from_millis(row.get::<_, i64>(8)?.max(0) as u64),
            max_delay: Duration::from_millis(row.get::<_, i64>(9)?.max(0) as u64),
        },
        last_error: row.get(10)?,
        lease_owner: row.get(11)?,
        lease_expires_at: match row.get::<_, Option<i64>>(12)? {
            Some(_) => Some(ms_col(row, 12)?),
            None => None,
        },
        created_at: ms_col(row, 13)?,
        updated_at: ms_col(row, 14)?,
    })
}

fn ms_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| bad_column(idx, format!("timestamp out of range: {}", ms)))
}

fn bad_column(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}
