use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::jobs::JobStore;

use super::{ChannelError, Delivery, JobMessage, JobSource};

/// Reads queued rows directly from the job store, at most once per
/// `interval`, oldest first.
pub struct PollingSource {
    store: JobStore,
    interval: Duration,
    last_poll: Mutex<Option<Instant>>,
}

impl PollingSource {
    pub fn new(store: JobStore, interval: Duration) -> Self {
        Self {
            store,
            interval,
            last_poll: Mutex::new(None),
        }
    }
}

#[async_trait]
impl JobSource for PollingSource {
    async fn receive(&self, max: usize) -> Result<Vec<Delivery>, ChannelError> {
        // Held across the sleep so concurrent slots take turns.
        let mut last_poll = self.last_poll.lock().await;
        if let Some(previous) = *last_poll {
            tokio::time::sleep_until(previous + self.interval).await;
        }
        *last_poll = Some(Instant::now());

        let jobs = self.store.queued(max.max(1))?;
        tracing::debug!(found = jobs.len(), "Polled job store");
        Ok(jobs
            .into_iter()
            .map(|job| Delivery::polled(JobMessage::new(job.group_id, job.id)))
            .collect())
    }

    fn name(&self) -> &'static str {
        "polling"
    }
}
