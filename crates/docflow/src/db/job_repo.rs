//! Job repository: row mapping and conditional updates for the `jobs` table.
//!
//! Every function that touches `status`, `lease_owner_token`,
//! `lease_expires_at`, `attempt_count` or `message_enqueued_at` is one
//! guarded `UPDATE` whose `WHERE` clause carries the whole precondition.
//! Callers learn whether the transition happened from the affected row
//! count (or the `RETURNING` row), never from a prior `SELECT`.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::{Database, DatabaseError};

/// Formats a timestamp for storage. Fixed width and always UTC, so
/// lexicographic comparison in SQL matches chronological order.
pub fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// A raw job row from the database.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRow {
    pub id: String,
    pub group_id: String,
    pub blob_ref: String,
    pub status: String,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub lease_owner_token: Option<String>,
    pub lease_expires_at: Option<String>,
    pub message_enqueued_at: Option<String>,
    pub progress_percent: u32,
    pub progress_detail: Option<String>,
    pub last_error: Option<String>,
    pub processing_started_at: Option<String>,
    pub completed_at: Option<String>,
    pub dead_lettered_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            group_id: row.get("group_id")?,
            blob_ref: row.get("blob_ref")?,
            status: row.get("status")?,
            attempt_count: row.get("attempt_count")?,
            max_attempts: row.get("max_attempts")?,
            lease_owner_token: row.get("lease_owner_token")?,
            lease_expires_at: row.get("lease_expires_at")?,
            message_enqueued_at: row.get("message_enqueued_at")?,
            progress_percent: row.get("progress_percent")?,
            progress_detail: row.get("progress_detail")?,
            last_error: row.get("last_error")?,
            processing_started_at: row.get("processing_started_at")?,
            completed_at: row.get("completed_at")?,
            dead_lettered_at: row.get("dead_lettered_at")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Query filter parameters for job listing.
#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub status: Option<String>,
    pub group_id: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Which owner may hand a job back to the pool.
#[derive(Debug, Clone, Copy)]
pub enum ReturnGuard<'a> {
    /// The worker holding this lease token.
    Owner(&'a str),
    /// Anyone, provided the lease expired before `now`.
    Expired,
}

/// What a return to the pool does with `message_enqueued_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingMessage {
    /// The job's message is settled; a new one may be dispatched.
    Clear,
    /// The same message will be redelivered, so the flag stays set while
    /// the job is queued. A job that goes to `failed` is always cleared.
    Keep,
}

/// Inserts a new job row.
pub fn insert(db: &Database, job: &JobRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO jobs (id, group_id, blob_ref, status, attempt_count, max_attempts,
             lease_owner_token, lease_expires_at, message_enqueued_at, progress_percent,
             progress_detail, last_error, processing_started_at, completed_at,
             dead_lettered_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                job.id,
                job.group_id,
                job.blob_ref,
                job.status,
                job.attempt_count,
                job.max_attempts,
                job.lease_owner_token,
                job.lease_expires_at,
                job.message_enqueued_at,
                job.progress_percent,
                job.progress_detail,
                job.last_error,
                job.processing_started_at,
                job.completed_at,
                job.dead_lettered_at,
                job.created_at,
                job.updated_at,
            ],
        )?;
        Ok(())
    })
}

/// Finds a job by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row("SELECT * FROM jobs WHERE id = ?1", params![id], JobRow::from_row)
            .optional()?;
        Ok(row)
    })
}

/// Deletes a job, returning the removed row.
pub fn delete(db: &Database, id: &str) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "DELETE FROM jobs WHERE id = ?1 RETURNING *",
                params![id],
                JobRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// Queries jobs with filters, returning (rows, total_count).
pub fn query(db: &Database, filter: &JobFilter) -> Result<(Vec<JobRow>, u64), DatabaseError> {
    db.with_conn(|conn| {
        let mut conditions = Vec::new();
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(ref status) = filter.status {
            conditions.push(format!("status = ?{}", param_values.len() + 1));
            param_values.push(Box::new(status.clone()));
        }
        if let Some(ref group_id) = filter.group_id {
            conditions.push(format!("group_id = ?{}", param_values.len() + 1));
            param_values.push(Box::new(group_id.clone()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) FROM jobs {}", where_clause);
        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let total: u64 = conn.query_row(&count_sql, params_ref.as_slice(), |r| r.get(0))?;

        let limit = filter.limit.unwrap_or(100) as i64;
        let offset = filter.offset.unwrap_or(0) as i64;
        param_values.push(Box::new(limit));
        param_values.push(Box::new(offset));
        let query_sql = format!(
            "SELECT * FROM jobs {} ORDER BY created_at DESC, id ASC LIMIT ?{} OFFSET ?{}",
            where_clause,
            param_values.len() - 1,
            param_values.len()
        );

        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&query_sql)?;
        let rows: Vec<JobRow> = stmt
            .query_map(params_ref.as_slice(), JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok((rows, total))
    })
}

/// Counts jobs per status, optionally restricted to one group.
pub fn count_by_status(
    db: &Database,
    group_id: Option<&str>,
) -> Result<Vec<(String, u64)>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM jobs
             WHERE (?1 IS NULL OR group_id = ?1)
             GROUP BY status ORDER BY status",
        )?;
        let counts = stmt
            .query_map(params![group_id], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(counts)
    })
}

/// Claimable queued jobs in insertion order, oldest first.
pub fn find_queued(db: &Database, limit: usize) -> Result<Vec<JobRow>, DatabaseError> {
    select_many(
        db,
        "SELECT * FROM jobs WHERE status = 'queued' AND attempt_count < max_attempts
         ORDER BY created_at ASC, id ASC LIMIT ?1",
        params![limit as i64],
    )
}

/// Claimable queued jobs with no outstanding message.
pub fn find_unenqueued(db: &Database, limit: usize) -> Result<Vec<JobRow>, DatabaseError> {
    select_many(
        db,
        "SELECT * FROM jobs
         WHERE status = 'queued' AND attempt_count < max_attempts
           AND message_enqueued_at IS NULL
         ORDER BY created_at ASC, id ASC LIMIT ?1",
        params![limit as i64],
    )
}

/// Processing jobs whose lease expired before `now`.
pub fn find_expired_leases(
    db: &Database,
    now: DateTime<Utc>,
    limit: usize,
) -> Result<Vec<JobRow>, DatabaseError> {
    select_many(
        db,
        "SELECT * FROM jobs
         WHERE status = 'processing' AND lease_expires_at IS NOT NULL AND lease_expires_at < ?1
         ORDER BY lease_expires_at ASC LIMIT ?2",
        params![format_timestamp(now), limit as i64],
    )
}

/// Failed (quarantined) jobs, most recently dead-lettered first.
pub fn find_failed(
    db: &Database,
    group_id: Option<&str>,
    limit: usize,
) -> Result<Vec<JobRow>, DatabaseError> {
    select_many(
        db,
        "SELECT * FROM jobs
         WHERE status = 'failed' AND (?1 IS NULL OR group_id = ?1)
         ORDER BY dead_lettered_at DESC, id ASC LIMIT ?2",
        params![group_id, limit as i64],
    )
}

fn select_many(
    db: &Database,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Sets `message_enqueued_at` if the job is queued and has no outstanding
/// message. Returns whether this caller won the flag.
pub fn mark_enqueued(db: &Database, id: &str, now: DateTime<Utc>) -> Result<bool, DatabaseError> {
    let now = format_timestamp(now);
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET message_enqueued_at = ?2, updated_at = ?2
             WHERE id = ?1 AND status = 'queued' AND message_enqueued_at IS NULL",
            params![id, now],
        )?;
        Ok(changed == 1)
    })
}

/// Clears `message_enqueued_at` on queued jobs whose message was
/// dispatched at or before `before` and never resolved. Returns the
/// cleared IDs.
pub fn clear_stale_enqueued(
    db: &Database,
    group_id: Option<&str>,
    before: DateTime<Utc>,
) -> Result<Vec<String>, DatabaseError> {
    let before = format_timestamp(before);
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "UPDATE jobs SET message_enqueued_at = NULL
             WHERE status = 'queued'
               AND message_enqueued_at IS NOT NULL
               AND message_enqueued_at <= ?1
               AND (?2 IS NULL OR group_id = ?2)
             RETURNING id",
        )?;
        let mut ids = stmt
            .query_map(params![before, group_id], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        ids.sort();
        Ok(ids)
    })
}

/// Clears `message_enqueued_at` only if it still holds `stamp`.
pub fn unmark_enqueued(
    db: &Database,
    id: &str,
    stamp: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let stamp = format_timestamp(stamp);
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET message_enqueued_at = NULL
             WHERE id = ?1 AND message_enqueued_at = ?2",
            params![id, stamp],
        )?;
        Ok(changed == 1)
    })
}

/// Claims a job for `token`. Grants when attempts remain and the job is
/// either queued or processing under an expired lease. Returns the
/// updated row on success.
pub fn acquire(
    db: &Database,
    id: &str,
    token: &str,
    now: DateTime<Utc>,
    expires_at: DateTime<Utc>,
) -> Result<Option<JobRow>, DatabaseError> {
    let now = format_timestamp(now);
    let expires_at = format_timestamp(expires_at);
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "UPDATE jobs SET
                    status = 'processing',
                    lease_owner_token = ?2,
                    lease_expires_at = ?3,
                    attempt_count = attempt_count + 1,
                    processing_started_at = ?4,
                    progress_percent = 0,
                    progress_detail = 'claimed',
                    updated_at = ?4
                 WHERE id = ?1
                   AND attempt_count < max_attempts
                   AND (status = 'queued'
                        OR (status = 'processing'
                            AND lease_expires_at IS NOT NULL
                            AND lease_expires_at < ?4))
                 RETURNING *",
                params![id, token, expires_at, now],
                JobRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// Extends a live lease. False when the token no longer owns the job.
pub fn renew(
    db: &Database,
    id: &str,
    token: &str,
    expires_at: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let expires_at = format_timestamp(expires_at);
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET lease_expires_at = ?3
             WHERE id = ?1 AND status = 'processing' AND lease_owner_token = ?2",
            params![id, token, expires_at],
        )?;
        Ok(changed == 1)
    })
}

/// Records advisory progress for the current lease holder.
pub fn update_progress(
    db: &Database,
    id: &str,
    token: &str,
    percent: u32,
    detail: &str,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let now = format_timestamp(now);
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET progress_percent = ?3, progress_detail = ?4, updated_at = ?5
             WHERE id = ?1 AND lease_owner_token = ?2",
            params![id, token, percent.min(100), detail, now],
        )?;
        Ok(changed == 1)
    })
}

/// Marks the job completed for the lease holder.
pub fn complete(
    db: &Database,
    id: &str,
    token: &str,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let now = format_timestamp(now);
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET
                status = 'completed',
                lease_owner_token = NULL,
                lease_expires_at = NULL,
                message_enqueued_at = NULL,
                progress_percent = 100,
                progress_detail = 'completed',
                completed_at = ?3,
                updated_at = ?3
             WHERE id = ?1 AND status = 'processing' AND lease_owner_token = ?2",
            params![id, token, now],
        )?;
        Ok(changed == 1)
    })
}

/// Hands a processing job back to the pool.
///
/// This is the single transition shared by failure-release and lease
/// reclaim. The job goes to `failed` when its attempts are exhausted and
/// to `queued` otherwise; `attempt_count` is never touched. Returns the
/// resulting status string, or `None` when the guard did not match.
pub fn return_to_pool(
    db: &Database,
    id: &str,
    guard: ReturnGuard<'_>,
    pending: PendingMessage,
    error: &str,
    now: DateTime<Utc>,
) -> Result<Option<String>, DatabaseError> {
    let now = format_timestamp(now);
    let (guard_sql, guard_value) = match guard {
        ReturnGuard::Owner(token) => ("lease_owner_token = ?4", token.to_string()),
        ReturnGuard::Expired => (
            "lease_expires_at IS NOT NULL AND lease_expires_at < ?4",
            now.clone(),
        ),
    };
    let message_sql = match pending {
        PendingMessage::Clear => "NULL",
        PendingMessage::Keep => {
            "CASE WHEN attempt_count >= max_attempts THEN NULL ELSE message_enqueued_at END"
        }
    };
    let sql = format!(
        "UPDATE jobs SET
            status = CASE WHEN attempt_count >= max_attempts THEN 'failed' ELSE 'queued' END,
            lease_owner_token = NULL,
            lease_expires_at = NULL,
            message_enqueued_at = {},
            last_error = ?2,
            dead_lettered_at = CASE WHEN attempt_count >= max_attempts THEN ?3 ELSE dead_lettered_at END,
            completed_at = CASE WHEN attempt_count >= max_attempts THEN ?3 ELSE completed_at END,
            updated_at = ?3
         WHERE id = ?1 AND status = 'processing' AND {}
         RETURNING status",
        message_sql, guard_sql
    );
    db.with_conn(|conn| {
        let status = conn
            .query_row(&sql, params![id, error, now, guard_value], |r| r.get(0))
            .optional()?;
        Ok(status)
    })
}

/// Moves a job to `failed` regardless of attempts. Completed jobs and
/// jobs processing under a live lease are left alone. `reason` replaces
/// `last_error` when given.
pub fn quarantine(
    db: &Database,
    id: &str,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let now = format_timestamp(now);
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET
                status = 'failed',
                last_error = COALESCE(?2, last_error),
                lease_owner_token = NULL,
                lease_expires_at = NULL,
                message_enqueued_at = NULL,
                dead_lettered_at = COALESCE(dead_lettered_at, ?3),
                completed_at = COALESCE(completed_at, ?3),
                updated_at = ?3
             WHERE id = ?1
               AND status != 'completed'
               AND (status != 'processing'
                    OR lease_expires_at IS NULL
                    OR lease_expires_at < ?3)",
            params![id, reason, now],
        )?;
        Ok(changed == 1)
    })
}

const RECOVER_SET: &str = "status = 'queued',
    attempt_count = 0,
    lease_owner_token = NULL,
    lease_expires_at = NULL,
    message_enqueued_at = NULL,
    dead_lettered_at = NULL,
    completed_at = NULL,
    processing_started_at = NULL,
    progress_percent = 0,
    progress_detail = NULL";

/// Resets a failed job to a fresh queued state. `last_error` is kept.
pub fn recover(db: &Database, id: &str, now: DateTime<Utc>) -> Result<bool, DatabaseError> {
    let now = format_timestamp(now);
    let sql = format!(
        "UPDATE jobs SET {}, updated_at = ?2 WHERE id = ?1 AND status = 'failed'",
        RECOVER_SET
    );
    db.with_conn(|conn| {
        let changed = conn.execute(&sql, params![id, now])?;
        Ok(changed == 1)
    })
}

/// Resets every failed job of a group. Returns the recovered IDs.
pub fn recover_group(
    db: &Database,
    group_id: &str,
    now: DateTime<Utc>,
) -> Result<Vec<String>, DatabaseError> {
    let now = format_timestamp(now);
    let sql = format!(
        "UPDATE jobs SET {}, updated_at = ?2 WHERE group_id = ?1 AND status = 'failed' RETURNING id",
        RECOVER_SET
    );
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(&sql)?;
        let mut ids = stmt
            .query_map(params![group_id, now], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        ids.sort();
        Ok(ids)
    })
}
