//! Lease manager: exclusive, expiring ownership of a job.
//!
//! `acquire`, `renew`, `release` and progress writes are each one
//! conditional update in `job_repo`. A worker learns it lost a job only
//! through a refused `renew` or a `Stale` release.

use std::time::Duration;

use crate::db::job_repo::{self, PendingMessage, ReturnGuard};
use crate::db::DatabaseError;

use super::clock::to_chrono;
use super::store::JobStore;
use super::types::{truncate_error, Job, JobStatus};

/// A granted claim.
#[derive(Debug, Clone)]
pub struct LeaseGrant {
    pub token: String,
    pub job: Job,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Success,
    Failure { error: String },
    /// A failure whose message the channel will deliver again. The job's
    /// outstanding-message flag stays set while it waits in `queued`.
    Redeliver { error: String },
}

/// What a release did to the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseResult {
    Completed,
    /// Returned to the pool with attempts remaining.
    Requeued,
    /// Attempts exhausted; the job is now `failed`.
    Quarantined,
    /// The token no longer owns the job. Nothing changed.
    Stale,
}

#[derive(Debug, Clone)]
pub struct LeaseManager {
    store: JobStore,
}

impl LeaseManager {
    pub fn new(store: JobStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Claims the job if it is queued, or processing under an expired
    /// lease, and has attempts left. Increments `attempt_count`.
    pub fn acquire(
        &self,
        job_id: &str,
        lease_duration: Duration,
    ) -> Result<Option<LeaseGrant>, DatabaseError> {
        let token = uuid::Uuid::new_v4().to_string();
        let now = self.store.now();
        let row = job_repo::acquire(
            self.store.database(),
            job_id,
            &token,
            now,
            now + to_chrono(lease_duration),
        )?;

        match row {
            Some(row) => {
                let job = Job::try_from(row)?;
                tracing::info!(
                    job_id,
                    attempt = job.attempt_count,
                    max_attempts = job.max_attempts,
                    "Lease granted"
                );
                Ok(Some(LeaseGrant { token, job }))
            }
            None => {
                tracing::debug!(job_id, "Lease refused");
                Ok(None)
            }
        }
    }

    /// Extends the lease to `now + lease_duration`. `false` means the
    /// token no longer owns the job and the holder must stop.
    pub fn renew(
        &self,
        job_id: &str,
        token: &str,
        lease_duration: Duration,
    ) -> Result<bool, DatabaseError> {
        let expires_at = self.store.now() + to_chrono(lease_duration);
        job_repo::renew(self.store.database(), job_id, token, expires_at)
    }

    pub fn release(
        &self,
        job_id: &str,
        token: &str,
        outcome: ReleaseOutcome,
    ) -> Result<ReleaseResult, DatabaseError> {
        let now = self.store.now();
        let db = self.store.database();
        let redeliver = matches!(outcome, ReleaseOutcome::Redeliver { .. });

        let result = match outcome {
            ReleaseOutcome::Success => {
                if job_repo::complete(db, job_id, token, now)? {
                    ReleaseResult::Completed
                } else {
                    ReleaseResult::Stale
                }
            }
            ReleaseOutcome::Failure { error } | ReleaseOutcome::Redeliver { error } => {
                let pending = if redeliver {
                    PendingMessage::Keep
                } else {
                    PendingMessage::Clear
                };
                let error = truncate_error(&error);
                let returned = job_repo::return_to_pool(
                    db,
                    job_id,
                    ReturnGuard::Owner(token),
                    pending,
                    &error,
                    now,
                )?;
                match returned {
                    Some(status) => returned_status(job_id, &status)?,
                    None => ReleaseResult::Stale,
                }
            }
        };

        tracing::info!(job_id, ?result, "Lease released");
        Ok(result)
    }

    /// Advisory progress, fenced by the lease token.
    pub fn update_progress(
        &self,
        job_id: &str,
        token: &str,
        percent: u32,
        detail: &str,
    ) -> Result<bool, DatabaseError> {
        job_repo::update_progress(
            self.store.database(),
            job_id,
            token,
            percent,
            detail,
            self.store.now(),
        )
    }
}

/// Maps the status reported by `return_to_pool`.
pub(crate) fn returned_status(job_id: &str, status: &str) -> Result<ReleaseResult, DatabaseError> {
    match JobStatus::parse(status) {
        Some(JobStatus::Queued) => Ok(ReleaseResult::Requeued),
        Some(JobStatus::Failed) => Ok(ReleaseResult::Quarantined),
        Some(other @ (JobStatus::Processing | JobStatus::Completed)) => {
            Err(DatabaseError::CorruptRow {
                id: job_id.to_string(),
                reason: format!("returned to pool as '{}'", other),
            })
        }
        None => Err(DatabaseError::CorruptRow {
            id: job_id.to_string(),
            reason: format!("unknown status '{}'", status),
        }),
    }
}
