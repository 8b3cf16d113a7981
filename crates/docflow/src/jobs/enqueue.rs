//! Enqueue gate: at most one outstanding queue message per job.
//!
//! The `message_enqueued_at` column is the guard. Winning the conditional
//! update that sets it is what entitles a caller to dispatch; losers get
//! `AlreadyEnqueued` or `NotQueued` without side effects. If dispatch then
//! fails, the flag is rolled back only if it still holds our timestamp.

use std::sync::Arc;

use crate::channel::{JobMessage, MessageSender};
use crate::db::job_repo;
use crate::error::EnqueueError;

use super::store::JobStore;
use super::types::JobStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A message was sent and the flag set.
    Dispatched,
    /// Another caller already has a message outstanding.
    AlreadyEnqueued,
    /// The job is not in `queued`.
    NotQueued,
    /// No message channel is configured; workers will find the job by
    /// polling.
    PollingOnly,
}

impl EnqueueOutcome {
    pub fn dispatched(&self) -> bool {
        matches!(self, EnqueueOutcome::Dispatched)
    }
}

#[derive(Clone)]
pub struct EnqueueGate {
    store: JobStore,
    sender: Option<Arc<dyn MessageSender>>,
}

impl EnqueueGate {
    pub fn new(store: JobStore, sender: Option<Arc<dyn MessageSender>>) -> Self {
        Self { store, sender }
    }

    pub fn has_channel(&self) -> bool {
        self.sender.is_some()
    }

    pub async fn try_enqueue(&self, job_id: &str) -> Result<EnqueueOutcome, EnqueueError> {
        let Some(sender) = &self.sender else {
            return match self.store.get(job_id)? {
                Some(_) => Ok(EnqueueOutcome::PollingOnly),
                None => Err(EnqueueError::NotFound(job_id.to_string())),
            };
        };

        let stamp = self.store.now();
        if !job_repo::mark_enqueued(self.store.database(), job_id, stamp)? {
            let job = self
                .store
                .get(job_id)?
                .ok_or_else(|| EnqueueError::NotFound(job_id.to_string()))?;
            let outcome = match job.status {
                JobStatus::Queued => EnqueueOutcome::AlreadyEnqueued,
                JobStatus::Processing | JobStatus::Completed | JobStatus::Failed => {
                    EnqueueOutcome::NotQueued
                }
            };
            tracing::debug!(job_id, ?outcome, "Enqueue skipped");
            return Ok(outcome);
        }

        // The row exists, we just updated it.
        let group_id = match self.store.get(job_id)? {
            Some(job) => job.group_id,
            None => return Err(EnqueueError::NotFound(job_id.to_string())),
        };

        if let Err(e) = sender.send(&JobMessage::new(group_id, job_id)).await {
            let rolled_back = job_repo::unmark_enqueued(self.store.database(), job_id, stamp)?;
            tracing::warn!(job_id, error = %e, rolled_back, "Message dispatch failed");
            return Err(EnqueueError::Dispatch {
                job_id: job_id.to_string(),
                source: e,
            });
        }

        tracing::info!(job_id, "Job enqueued");
        Ok(EnqueueOutcome::Dispatched)
    }
}

impl std::fmt::Debug for EnqueueGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnqueueGate")
            .field("has_channel", &self.has_channel())
            .finish()
    }
}
