//! Periodic sweep that reclaims jobs abandoned by crashed workers.
//!
//! A reclaim is the same return-to-pool transition a failure release
//! uses, guarded by "lease expired" instead of by token. It never touches
//! `attempt_count`. When an enqueue gate with a channel is attached, the
//! sweep also re-dispatches queued jobs that have no outstanding message,
//! after first giving up on messages that have been outstanding longer
//! than `stale_enqueue_after` (lost with a restarted broker, or parked in
//! its dead-letter queue).

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::db::job_repo::{self, PendingMessage, ReturnGuard};
use crate::db::DatabaseError;

use super::enqueue::{EnqueueGate, EnqueueOutcome};
use super::lease::{returned_status, ReleaseResult};
use super::store::JobStore;

pub const LEASE_EXPIRED_ERROR: &str = "Lease expired - worker may have crashed";

const SWEEP_LIMIT: usize = 500;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub reclaimed: usize,
    pub quarantined: usize,
    pub stale_cleared: usize,
    pub reenqueued: usize,
}

#[derive(Debug, Clone)]
pub struct Janitor {
    store: JobStore,
    gate: Option<EnqueueGate>,
    stale_enqueue_after: Option<Duration>,
}

impl Janitor {
    pub fn new(store: JobStore, gate: Option<EnqueueGate>) -> Self {
        Self {
            store,
            gate,
            stale_enqueue_after: None,
        }
    }

    /// Treats a message still outstanding after `after` as lost: its flag
    /// is cleared and the job dispatched again on the same sweep.
    pub fn with_stale_enqueue_after(mut self, after: Duration) -> Self {
        self.stale_enqueue_after = Some(after);
        self
    }

    pub async fn sweep(&self) -> Result<SweepReport, DatabaseError> {
        let mut report = SweepReport::default();
        let db = self.store.database();

        for job in self.store.expired_leases(SWEEP_LIMIT)? {
            let returned = job_repo::return_to_pool(
                db,
                &job.id,
                ReturnGuard::Expired,
                PendingMessage::Clear,
                LEASE_EXPIRED_ERROR,
                self.store.now(),
            )?;
            // None: the holder renewed or released in between.
            let Some(status) = returned else { continue };
            match returned_status(&job.id, &status)? {
                ReleaseResult::Requeued => report.reclaimed += 1,
                ReleaseResult::Quarantined => {
                    report.quarantined += 1;
                    tracing::warn!(
                        job_id = %job.id,
                        "Abandoned job exhausted its attempts, quarantined"
                    );
                }
                ReleaseResult::Completed | ReleaseResult::Stale => {}
            }
        }

        if let Some(gate) = self.gate.as_ref().filter(|g| g.has_channel()) {
            if let Some(after) = self.stale_enqueue_after {
                let cleared = self.store.clear_stale_enqueues(None, after)?;
                if !cleared.is_empty() {
                    tracing::warn!(jobs = ?cleared, "Cleared stale enqueue flags");
                }
                report.stale_cleared = cleared.len();
            }
            for job in self.store.unenqueued(SWEEP_LIMIT)? {
                match gate.try_enqueue(&job.id).await {
                    Ok(EnqueueOutcome::Dispatched) => report.reenqueued += 1,
                    Ok(_) => {}
                    Err(e) => tracing::warn!(job_id = %job.id, error = %e, "Re-enqueue failed"),
                }
            }
        }

        if report != SweepReport::default() {
            tracing::info!(
                reclaimed = report.reclaimed,
                quarantined = report.quarantined,
                stale_cleared = report.stale_cleared,
                reenqueued = report.reenqueued,
                "Janitor sweep"
            );
        }
        Ok(report)
    }

    /// Sweeps once immediately, then every `interval` until `shutdown`.
    pub async fn run(self, interval: Duration, shutdown: CancellationToken) {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = timer.tick() => {}
            }
            if let Err(e) = self.sweep().await {
                tracing::error!(error = %e, "Janitor sweep failed");
            }
        }
        tracing::debug!("Janitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryQueue;
    use crate::db::Database;
    use crate::jobs::clock::ManualClock;
    use crate::jobs::{JobStatus, LeaseManager, NewJob};
    use chrono::Utc;
    use std::sync::Arc;

    const LEASE: Duration = Duration::from_secs(300);

    struct Fixture {
        store: JobStore,
        clock: Arc<ManualClock>,
        leases: LeaseManager,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let db = Database::open_in_memory().expect("Failed to create test database");
        let store = JobStore::with_clock(db, clock.clone());
        Fixture {
            leases: LeaseManager::new(store.clone()),
            store,
            clock,
        }
    }

    fn janitor(store: &JobStore, gate: Option<EnqueueGate>) -> Janitor {
        Janitor::new(store.clone(), gate)
    }

    #[tokio::test]
    async fn test_live_lease_is_not_reclaimed() {
        let f = fixture();
        f.store.create(NewJob::new("doc", "g", "b")).unwrap();
        f.leases.acquire("doc", LEASE).unwrap().unwrap();

        let report = janitor(&f.store, None).sweep().await.unwrap();
        assert_eq!(report, SweepReport::default());
        assert_eq!(f.store.get("doc").unwrap().unwrap().status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn test_expired_lease_is_requeued_without_touching_attempts() {
        let f = fixture();
        f.store.create(NewJob::new("doc", "g", "b")).unwrap();
        f.leases.acquire("doc", LEASE).unwrap().unwrap();

        f.clock.advance(LEASE + Duration::from_secs(60));
        let report = janitor(&f.store, None).sweep().await.unwrap();
        assert_eq!(report.reclaimed, 1);

        let job = f.store.get("doc").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempt_count, 1);
        assert!(job.lease.is_none());
        assert_eq!(job.last_error.as_deref(), Some(LEASE_EXPIRED_ERROR));
    }

    #[tokio::test]
    async fn test_exhausted_job_is_quarantined_not_requeued() {
        let f = fixture();
        f.store
            .create(NewJob::new("doc", "g", "b").with_max_attempts(1))
            .unwrap();
        f.leases.acquire("doc", LEASE).unwrap().unwrap();

        f.clock.advance(LEASE * 2);
        let report = janitor(&f.store, None).sweep().await.unwrap();
        assert_eq!(report.quarantined, 1);
        assert_eq!(report.reclaimed, 0);

        let job = f.store.get("doc").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.dead_lettered_at.is_some());
    }

    #[tokio::test]
    async fn test_reenqueues_orphans_when_channel_present() {
        let f = fixture();
        f.store.create(NewJob::new("doc", "g", "b")).unwrap();
        let queue = MemoryQueue::default();
        let gate = EnqueueGate::new(f.store.clone(), Some(Arc::new(queue.clone())));

        let j = janitor(&f.store, Some(gate));
        assert_eq!(j.sweep().await.unwrap().reenqueued, 1);
        assert_eq!(j.sweep().await.unwrap().reenqueued, 0);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_lost_message_is_redispatched_once_stale() {
        let f = fixture();
        f.store.create(NewJob::new("doc", "g", "b")).unwrap();

        // Dispatched through a broker that is then lost with its contents.
        let lost = MemoryQueue::default();
        let gate = EnqueueGate::new(f.store.clone(), Some(Arc::new(lost.clone())));
        assert!(gate.try_enqueue("doc").await.unwrap().dispatched());
        drop(lost);

        let queue = MemoryQueue::default();
        let gate = EnqueueGate::new(f.store.clone(), Some(Arc::new(queue.clone())));
        let j = janitor(&f.store, Some(gate.clone()))
            .with_stale_enqueue_after(Duration::from_secs(600));

        let report = j.sweep().await.unwrap();
        assert_eq!(report.stale_cleared, 0);
        assert_eq!(report.reenqueued, 0);
        assert_eq!(
            gate.try_enqueue("doc").await.unwrap(),
            EnqueueOutcome::AlreadyEnqueued
        );

        f.clock.advance(Duration::from_secs(601));
        let report = j.sweep().await.unwrap();
        assert_eq!(report.stale_cleared, 1);
        assert_eq!(report.reenqueued, 1);
        assert_eq!(queue.len(), 1);

        // The fresh message is young again; nothing more is sent.
        assert_eq!(j.sweep().await.unwrap().reenqueued, 0);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_flags_kept_without_threshold() {
        let f = fixture();
        f.store.create(NewJob::new("doc", "g", "b")).unwrap();
        job_repo::mark_enqueued(f.store.database(), "doc", f.store.now()).unwrap();
        let queue = MemoryQueue::default();
        let gate = EnqueueGate::new(f.store.clone(), Some(Arc::new(queue.clone())));

        f.clock.advance(Duration::from_secs(86_400));
        let report = janitor(&f.store, Some(gate)).sweep().await.unwrap();
        assert_eq!(report, SweepReport::default());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let f = fixture();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(
            janitor(&f.store, None).run(Duration::from_millis(10), shutdown.clone()),
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
