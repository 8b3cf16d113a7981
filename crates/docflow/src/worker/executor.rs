//! Per-job state machine: claim, run the pipeline under a renewing lease,
//! report the outcome, settle the message.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{field, info_span, Instrument, Span};

use crate::channel::{Delivery, MessageHandle};
use crate::jobs::{
    truncate_error, EnqueueGate, LeaseGrant, LeaseManager, ReleaseOutcome, ReleaseResult,
};
use crate::pipeline::{Pipeline, PipelineContext, PipelineError, StoreProgress};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorSettings {
    pub lease_duration: Duration,
    /// Must be shorter than both the lease and the message lock.
    pub renew_interval: Duration,
    /// Abandon (nack) on transient failure and let the channel redeliver,
    /// instead of acking and re-enqueueing.
    pub retry_via_redelivery: bool,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(300),
            renew_interval: Duration::from_secs(120),
            retry_via_redelivery: false,
        }
    }
}

/// How one delivery was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// Failed with attempts left; back in `queued`.
    Requeued,
    /// Failed with attempts exhausted; now `failed`.
    Quarantined,
    /// Lease refused: someone else holds it, the job is exhausted or
    /// finished, or it does not exist.
    Refused,
    /// The lease was lost mid-run. Nothing was reported.
    OwnershipLost,
    /// The job store could not be reached; the message was abandoned.
    StoreUnavailable,
}

pub struct Executor {
    leases: LeaseManager,
    gate: EnqueueGate,
    pipeline: Arc<Pipeline>,
    settings: ExecutorSettings,
}

impl Executor {
    pub fn new(
        leases: LeaseManager,
        gate: EnqueueGate,
        pipeline: Arc<Pipeline>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            leases,
            gate,
            pipeline,
            settings,
        }
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    pub async fn handle(&self, delivery: Delivery) -> JobOutcome {
        let span = info_span!(
            "job",
            job_id = %delivery.message.job_id,
            group_id = %delivery.message.group_id,
            attempt = field::Empty,
        );
        self.handle_inner(delivery).instrument(span).await
    }

    async fn handle_inner(&self, delivery: Delivery) -> JobOutcome {
        let Delivery { message, handle } = delivery;
        let job_id = message.job_id.as_str();

        let grant = match self.leases.acquire(job_id, self.settings.lease_duration) {
            Ok(Some(grant)) => grant,
            Ok(None) => {
                tracing::info!("Claim refused, discarding message");
                settle(handle.as_deref(), Settle::Ack).await;
                return JobOutcome::Refused;
            }
            Err(e) => {
                tracing::error!(error = %e, "Claim failed, abandoning message");
                settle(handle.as_deref(), Settle::Abandon).await;
                return JobOutcome::StoreUnavailable;
            }
        };
        Span::current().record("attempt", grant.job.attempt_count);
        if grant.job.group_id != message.group_id {
            tracing::warn!(stored_group = %grant.job.group_id, "Message group does not match job");
        }

        let lost = CancellationToken::new();
        let done = CancellationToken::new();
        let renewal = self.spawn_renewal(&grant, handle.clone(), lost.clone(), done.clone());

        let mut ctx = PipelineContext::new(&grant.job);
        let progress = StoreProgress::new(self.leases.clone(), job_id, grant.token.clone());
        let result = self.pipeline.run(&mut ctx, &progress, &lost).await;

        done.cancel();
        if let Err(e) = renewal.await {
            tracing::error!(error = %e, "Renewal task panicked");
        }

        if lost.is_cancelled() || matches!(result, Err(PipelineError::OwnershipLost)) {
            tracing::warn!("Lease ownership lost, dropping job without reporting");
            return JobOutcome::OwnershipLost;
        }

        match result {
            Ok(()) => self.finish_success(job_id, &grant.token, handle.as_deref()).await,
            Err(PipelineError::Stage(e)) => {
                let transient = e.is_transient();
                self.finish_failure(job_id, &grant.token, &e.to_string(), transient, handle.as_deref())
                    .await
            }
            Err(PipelineError::OwnershipLost) => JobOutcome::OwnershipLost,
        }
    }

    async fn finish_success(
        &self,
        job_id: &str,
        token: &str,
        handle: Option<&dyn MessageHandle>,
    ) -> JobOutcome {
        match self.leases.release(job_id, token, ReleaseOutcome::Success) {
            Ok(ReleaseResult::Completed) => {
                tracing::info!("Job completed");
                settle(handle, Settle::Ack).await;
                JobOutcome::Completed
            }
            Ok(other) => {
                tracing::warn!(result = ?other, "Success report was not accepted");
                JobOutcome::OwnershipLost
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to record completion");
                settle(handle, Settle::Abandon).await;
                JobOutcome::StoreUnavailable
            }
        }
    }

    async fn finish_failure(
        &self,
        job_id: &str,
        token: &str,
        error: &str,
        transient: bool,
        handle: Option<&dyn MessageHandle>,
    ) -> JobOutcome {
        let error = truncate_error(error);
        // The abandoned message is still live in the channel, so its
        // enqueue flag has to survive the release.
        let redeliver = self.settings.retry_via_redelivery && transient && handle.is_some();
        let outcome = if redeliver {
            ReleaseOutcome::Redeliver {
                error: error.clone(),
            }
        } else {
            ReleaseOutcome::Failure {
                error: error.clone(),
            }
        };

        match self.leases.release(job_id, token, outcome) {
            Ok(ReleaseResult::Requeued) if redeliver => {
                tracing::info!(error = %error, "Transient failure, leaving retry to redelivery");
                settle(handle, Settle::Abandon).await;
                JobOutcome::Requeued
            }
            Ok(ReleaseResult::Requeued) => {
                tracing::info!(error = %error, "Job failed, requeued");
                match self.gate.try_enqueue(job_id).await {
                    Ok(outcome) => tracing::debug!(?outcome, "Re-enqueue after failure"),
                    Err(e) => tracing::warn!(error = %e, "Re-enqueue after failure failed"),
                }
                settle(handle, Settle::Ack).await;
                JobOutcome::Requeued
            }
            Ok(ReleaseResult::Quarantined) => {
                tracing::warn!(error = %error, "Retry budget exhausted, job failed");
                settle(handle, Settle::Ack).await;
                JobOutcome::Quarantined
            }
            Ok(ReleaseResult::Stale) | Ok(ReleaseResult::Completed) => {
                tracing::warn!("Failure report was not accepted");
                JobOutcome::OwnershipLost
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to record failure");
                settle(handle, Settle::Abandon).await;
                JobOutcome::StoreUnavailable
            }
        }
    }

    /// Renews the lease (and the message lock, if any) every
    /// `renew_interval` until `done` fires. A refused lease renewal fires
    /// `lost` and ends the task.
    fn spawn_renewal(
        &self,
        grant: &LeaseGrant,
        handle: Option<Arc<dyn MessageHandle>>,
        lost: CancellationToken,
        done: CancellationToken,
    ) -> JoinHandle<()> {
        let leases = self.leases.clone();
        let job_id = grant.job.id.clone();
        let token = grant.token.clone();
        let settings = self.settings;

        tokio::spawn(
            async move {
                let mut timer = tokio::time::interval(settings.renew_interval);
                timer.tick().await; // skip immediate first tick

                loop {
                    tokio::select! {
                        _ = done.cancelled() => break,
                        _ = timer.tick() => {}
                    }

                    match leases.renew(&job_id, &token, settings.lease_duration) {
                        Ok(true) => tracing::debug!("Lease renewed"),
                        Ok(false) => {
                            tracing::warn!("Lease renewal refused, cancelling job");
                            lost.cancel();
                            break;
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Lease renewal failed, will retry");
                            continue;
                        }
                    }

                    if let Some(handle) = &handle {
                        if let Err(e) = handle.renew_lock(settings.lease_duration).await {
                            tracing::warn!(error = %e, "Message lock renewal failed");
                        }
                    }
                }
            }
            .instrument(Span::current()),
        )
    }
}

enum Settle {
    Ack,
    Abandon,
}

async fn settle(handle: Option<&dyn MessageHandle>, how: Settle) {
    let Some(handle) = handle else { return };
    let result = match how {
        Settle::Ack => handle.ack().await,
        Settle::Abandon => handle.abandon().await,
    };
    if let Err(e) = result {
        tracing::warn!(error = %e, "Message settlement failed");
    }
}
