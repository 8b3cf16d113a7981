//! Quarantine of exhausted jobs and operator recovery.

use crate::db::job_repo;
use crate::db::DatabaseError;

use super::store::JobStore;
use super::types::{truncate_error, Job};

/// What to recover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoverTarget {
    Job(String),
    Group(String),
}

#[derive(Debug, Clone)]
pub struct DeadLetterHandler {
    store: JobStore,
}

impl DeadLetterHandler {
    pub fn new(store: JobStore) -> Self {
        Self { store }
    }

    /// Marks the job `failed`, taking it out of claim eligibility.
    /// Idempotent for jobs that are already failed. Completed jobs and
    /// jobs under a live lease are left alone and `false` is returned.
    pub fn quarantine(&self, job_id: &str, reason: Option<&str>) -> Result<bool, DatabaseError> {
        let reason = reason.map(truncate_error);
        let changed = job_repo::quarantine(
            self.store.database(),
            job_id,
            reason.as_deref(),
            self.store.now(),
        )?;
        if changed {
            tracing::warn!(job_id, reason = reason.as_deref().unwrap_or(""), "Job quarantined");
        }
        Ok(changed)
    }

    /// Resets failed jobs to `queued` with zero attempts. Jobs in any
    /// other state are untouched. Returns the IDs actually recovered.
    pub fn recover(&self, target: &RecoverTarget) -> Result<Vec<String>, DatabaseError> {
        let now = self.store.now();
        let db = self.store.database();
        let recovered = match target {
            RecoverTarget::Job(id) => {
                if job_repo::recover(db, id, now)? {
                    vec![id.clone()]
                } else {
                    Vec::new()
                }
            }
            RecoverTarget::Group(group_id) => job_repo::recover_group(db, group_id, now)?,
        };
        tracing::info!(?target, recovered = recovered.len(), "Recovered dead-lettered jobs");
        Ok(recovered)
    }

    pub fn list(&self, group_id: Option<&str>, limit: usize) -> Result<Vec<Job>, DatabaseError> {
        self.store.failed(group_id, limit)
    }
}
