//! Operations the upstream application calls: create, enqueue, inspect,
//! delete and recover jobs.

use std::sync::Arc;
use std::time::Duration;

use crate::channel::MessageSender;
use crate::db::job_repo::JobFilter;
use crate::db::Database;
use crate::error::{EnqueueError, Result};
use crate::jobs::{
    Clock, DeadLetterHandler, EnqueueGate, EnqueueOutcome, Job, JobStore, NewJob, RecoverTarget,
    StatusCounts, SystemClock,
};
use crate::pipeline::{Indexer, Stage, StageError};

#[derive(Clone)]
pub struct Coordinator {
    store: JobStore,
    gate: EnqueueGate,
    dead_letter: DeadLetterHandler,
    indexer: Arc<dyn Indexer>,
    deindex_timeout: Duration,
}

impl Coordinator {
    pub fn new(
        db: Database,
        sender: Option<Arc<dyn MessageSender>>,
        indexer: Arc<dyn Indexer>,
    ) -> Self {
        Self::with_clock(db, Arc::new(SystemClock), sender, indexer)
    }

    pub fn with_clock(
        db: Database,
        clock: Arc<dyn Clock>,
        sender: Option<Arc<dyn MessageSender>>,
        indexer: Arc<dyn Indexer>,
    ) -> Self {
        let store = JobStore::with_clock(db, clock);
        Self {
            gate: EnqueueGate::new(store.clone(), sender),
            dead_letter: DeadLetterHandler::new(store.clone()),
            store,
            indexer,
            deindex_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_deindex_timeout(mut self, timeout: Duration) -> Self {
        self.deindex_timeout = timeout;
        self
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn create_job(&self, new: NewJob) -> Result<Job> {
        let job = self.store.create(new)?;
        tracing::info!(job_id = %job.id, group_id = %job.group_id, "Job created");
        Ok(job)
    }

    pub async fn try_enqueue(&self, job_id: &str) -> std::result::Result<EnqueueOutcome, EnqueueError> {
        self.gate.try_enqueue(job_id).await
    }

    pub fn get_job_status(&self, job_id: &str) -> Result<Option<Job>> {
        Ok(self.store.get(job_id)?)
    }

    /// Deletes the job, then tombstones its index entries.
    ///
    /// The row goes first so a worker still holding the lease can no
    /// longer report an outcome. Returns `None` when the job did not exist.
    pub async fn delete_job(&self, job_id: &str) -> Result<Option<Job>> {
        let Some(job) = self.store.delete(job_id)? else {
            return Ok(None);
        };
        tracing::info!(job_id, status = %job.status, "Job deleted");

        match tokio::time::timeout(
            self.deindex_timeout,
            self.indexer.deindex(&job.group_id, &job.id),
        )
        .await
        {
            Ok(Ok(())) => Ok(Some(job)),
            Ok(Err(e)) => {
                tracing::error!(job_id, error = %e, "Deindex failed after delete");
                Err(e.into())
            }
            Err(_) => {
                tracing::error!(job_id, "Deindex timed out after delete");
                Err(StageError::timeout(Stage::Index, self.deindex_timeout).into())
            }
        }
    }

    pub fn recover(&self, job_id: &str) -> Result<Vec<String>> {
        Ok(self.dead_letter.recover(&RecoverTarget::Job(job_id.to_string()))?)
    }

    pub fn recover_group(&self, group_id: &str) -> Result<Vec<String>> {
        Ok(self
            .dead_letter
            .recover(&RecoverTarget::Group(group_id.to_string()))?)
    }

    /// Recovers failed jobs and passes each one straight to the enqueue
    /// gate. A dispatch failure leaves that job queued and unenqueued for
    /// the janitor to pick up; it does not abort the rest.
    pub async fn recover_and_enqueue(
        &self,
        target: &RecoverTarget,
    ) -> Result<Vec<(String, EnqueueOutcome)>> {
        let recovered = self.dead_letter.recover(target)?;
        let mut outcomes = Vec::with_capacity(recovered.len());
        for job_id in recovered {
            match self.gate.try_enqueue(&job_id).await {
                Ok(outcome) => outcomes.push((job_id, outcome)),
                Err(EnqueueError::Dispatch { job_id, source }) => {
                    tracing::warn!(job_id = %job_id, error = %source, "Dispatch after recovery failed");
                    outcomes.push((job_id, EnqueueOutcome::NotQueued));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(outcomes)
    }

    /// Forgets messages that have been outstanding for at least
    /// `older_than` on queued jobs, so the next `try_enqueue` or janitor
    /// sweep dispatches them again. Use after a broker loses messages or
    /// parks them in its dead-letter queue.
    pub fn clear_stale_enqueues(
        &self,
        group_id: Option<&str>,
        older_than: Duration,
    ) -> Result<Vec<String>> {
        let cleared = self.store.clear_stale_enqueues(group_id, older_than)?;
        if !cleared.is_empty() {
            tracing::info!(count = cleared.len(), ?group_id, "Cleared stale enqueue flags");
        }
        Ok(cleared)
    }

    pub fn status_counts(&self, group_id: Option<&str>) -> Result<StatusCounts> {
        Ok(self.store.status_counts(group_id)?)
    }

    pub fn list_failed(&self, group_id: Option<&str>, limit: usize) -> Result<Vec<Job>> {
        Ok(self.dead_letter.list(group_id, limit)?)
    }

    pub fn list_jobs(&self, filter: &JobFilter) -> Result<(Vec<Job>, u64)> {
        Ok(self.store.list(filter)?)
    }
}
