//! Typed view over the `jobs` table.
//!
//! `JobStore` owns the database handle and the clock. Every component that
//! mutates job state goes through it so "now" is read from one place.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::db::job_repo::{self, JobFilter, JobRow};
use crate::db::{Database, DatabaseError};

use super::clock::{to_chrono, Clock, SystemClock};
use super::types::{Job, JobStatus, NewJob, StatusCounts};

#[derive(Debug, Clone)]
pub struct JobStore {
    db: Database,
    clock: Arc<dyn Clock>,
}

impl JobStore {
    pub fn new(db: Database) -> Self {
        Self::with_clock(db, Arc::new(SystemClock))
    }

    pub fn with_clock(db: Database, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Inserts a fresh `queued` job with zero attempts. A job must be
    /// allowed at least one attempt.
    pub fn create(&self, new: NewJob) -> Result<Job, DatabaseError> {
        if new.max_attempts < 1 {
            return Err(DatabaseError::InvalidJob {
                id: new.id,
                reason: "max_attempts must be at least 1".to_string(),
            });
        }
        let now = job_repo::format_timestamp(self.now());
        let row = JobRow {
            id: new.id,
            group_id: new.group_id,
            blob_ref: new.blob_ref,
            status: JobStatus::Queued.as_str().to_string(),
            attempt_count: 0,
            max_attempts: new.max_attempts,
            lease_owner_token: None,
            lease_expires_at: None,
            message_enqueued_at: None,
            progress_percent: 0,
            progress_detail: None,
            last_error: None,
            processing_started_at: None,
            completed_at: None,
            dead_lettered_at: None,
            created_at: now.clone(),
            updated_at: now,
        };
        job_repo::insert(&self.db, &row)?;
        Job::try_from(row)
    }

    pub fn get(&self, id: &str) -> Result<Option<Job>, DatabaseError> {
        job_repo::find_by_id(&self.db, id)?
            .map(Job::try_from)
            .transpose()
    }

    pub fn delete(&self, id: &str) -> Result<Option<Job>, DatabaseError> {
        job_repo::delete(&self.db, id)?.map(Job::try_from).transpose()
    }

    /// Lists jobs newest first. Returns the page and the total match count.
    pub fn list(&self, filter: &JobFilter) -> Result<(Vec<Job>, u64), DatabaseError> {
        let (rows, total) = job_repo::query(&self.db, filter)?;
        Ok((into_jobs(rows)?, total))
    }

    pub fn status_counts(&self, group_id: Option<&str>) -> Result<StatusCounts, DatabaseError> {
        let mut counts = StatusCounts::default();
        for (status, count) in job_repo::count_by_status(&self.db, group_id)? {
            let parsed = JobStatus::parse(&status).ok_or_else(|| DatabaseError::CorruptRow {
                id: format!("<status count for '{}'>", status),
                reason: "unknown status".to_string(),
            })?;
            counts.add(parsed, count);
        }
        Ok(counts)
    }

    pub fn queued(&self, limit: usize) -> Result<Vec<Job>, DatabaseError> {
        into_jobs(job_repo::find_queued(&self.db, limit)?)
    }

    pub fn unenqueued(&self, limit: usize) -> Result<Vec<Job>, DatabaseError> {
        into_jobs(job_repo::find_unenqueued(&self.db, limit)?)
    }

    /// Clears `message_enqueued_at` on queued jobs whose message has been
    /// outstanding for at least `older_than`, making them eligible for a
    /// fresh dispatch. Returns the cleared IDs.
    pub fn clear_stale_enqueues(
        &self,
        group_id: Option<&str>,
        older_than: Duration,
    ) -> Result<Vec<String>, DatabaseError> {
        let before = self.now() - to_chrono(older_than);
        job_repo::clear_stale_enqueued(&self.db, group_id, before)
    }

    pub fn expired_leases(&self, limit: usize) -> Result<Vec<Job>, DatabaseError> {
        into_jobs(job_repo::find_expired_leases(&self.db, self.now(), limit)?)
    }

    pub fn failed(&self, group_id: Option<&str>, limit: usize) -> Result<Vec<Job>, DatabaseError> {
        into_jobs(job_repo::find_failed(&self.db, group_id, limit)?)
    }
}

fn into_jobs(rows: Vec<JobRow>) -> Result<Vec<Job>, DatabaseError> {
    rows.into_iter().map(Job::try_from).collect()
}
