use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::channel::{ChannelError, JobSource};
use crate::error::WorkerError;
use crate::jobs::Janitor;

use super::executor::Executor;

/// Pause after a failed receive before asking the source again.
const RECEIVE_BACKOFF: Duration = Duration::from_secs(1);

/// Worker slots plus the janitor, all stopped by one cancellation token.
///
/// Each slot handles one job at a time. On shutdown a slot stops asking
/// for work but finishes the job it holds.
pub struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub slots: usize,
    pub batch_size: usize,
    pub janitor_interval: Duration,
}

impl WorkerPool {
    /// Starts `settings.slots` executor loops over `source` and, when
    /// given, the janitor. `slots` may be zero to run only the janitor.
    pub fn start(
        executor: Arc<Executor>,
        source: Arc<dyn JobSource>,
        janitor: Option<Janitor>,
        settings: PoolSettings,
        shutdown: CancellationToken,
    ) -> Self {
        let mut workers = Vec::with_capacity(settings.slots + 1);

        if let Some(janitor) = janitor {
            workers.push(tokio::spawn(
                janitor.run(settings.janitor_interval, shutdown.clone()),
            ));
        }

        for worker_id in 0..settings.slots {
            let span = tracing::info_span!("worker", worker_id);
            workers.push(tokio::spawn(
                run_worker(
                    Arc::clone(&executor),
                    Arc::clone(&source),
                    settings.batch_size.max(1),
                    shutdown.clone(),
                )
                .instrument(span),
            ));
        }

        info!(
            slots = settings.slots,
            source = source.name(),
            "Started worker pool"
        );

        Self { workers, shutdown }
    }

    pub fn shutdown(&self) {
        info!("Shutting down worker pool...");
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Waits for every slot and the janitor to exit.
    pub async fn wait(self) -> Result<(), WorkerError> {
        let mut first_panic = None;
        for (i, result) in join_all(self.workers).await.into_iter().enumerate() {
            match result {
                Ok(()) => debug!("Worker task {} finished", i),
                Err(e) => {
                    error!("Worker task {} panicked: {}", i, e);
                    first_panic.get_or_insert_with(|| e.to_string());
                }
            }
        }
        info!("All workers have stopped");
        match first_panic {
            Some(message) => Err(WorkerError::Panicked(message)),
            None => Ok(()),
        }
    }
}

async fn run_worker(
    executor: Arc<Executor>,
    source: Arc<dyn JobSource>,
    batch_size: usize,
    shutdown: CancellationToken,
) {
    debug!("Worker started");

    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = source.receive(batch_size) => received,
        };

        match received {
            Ok(batch) => {
                for delivery in batch {
                    // Deliveries left in the batch stay locked and are
                    // redelivered once their lock runs out.
                    if shutdown.is_cancelled() {
                        break;
                    }
                    let outcome = executor.handle(delivery).await;
                    debug!(?outcome, "Delivery handled");
                }
            }
            Err(ChannelError::Closed) => {
                info!("Job source closed");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Receive failed");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(RECEIVE_BACKOFF) => {}
                }
            }
        }
    }

    debug!("Worker stopped");
}
