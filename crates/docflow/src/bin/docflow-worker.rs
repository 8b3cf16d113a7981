//! Standalone worker process: executor slots plus the janitor.
//!
//! Usage: `docflow-worker [CONFIG_PATH]` (default `docflow-worker.json`,
//! or built-in defaults when that file does not exist).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use docflow::channel::{JobSource, MemoryQueue, MessageSender, PollingSource};
use docflow::config::{self, ChannelKind, WorkerConfig};
use docflow::error::{ConfigError, DocflowError, WorkerError};
use docflow::jobs::{EnqueueGate, Janitor, JobStore, LeaseManager};
use docflow::pipeline::{FsDownloader, HttpStages, Pipeline, PlainTextExtractor, Stages, WindowChunker};
use docflow::worker::{Executor, WorkerPool};
use docflow::{init_tracing, Database};

const DEFAULT_CONFIG_PATH: &str = "docflow-worker.json";

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Worker exited with error");
            eprintln!("docflow-worker: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_worker_config() -> Result<WorkerConfig, ConfigError> {
    let explicit = std::env::args().nth(1).map(PathBuf::from);
    match explicit {
        Some(path) => config::load_config(path),
        None => {
            let path = PathBuf::from(DEFAULT_CONFIG_PATH);
            if path.exists() {
                config::load_config(path)
            } else {
                let mut config = WorkerConfig::default();
                config::apply_env_overrides(&mut config)?;
                config::validate_config(&config)?;
                Ok(config)
            }
        }
    }
}

fn build_stages(config: &WorkerConfig) -> Result<Stages, ConfigError> {
    let url = config.stages.service_url.as_deref().ok_or_else(|| {
        ConfigError::MissingCollaborator(
            "stages.service_url (or DOCFLOW_STAGE_SERVICE_URL) is required for embed/index"
                .to_string(),
        )
    })?;
    let http = Arc::new(HttpStages::new(url)?);

    Ok(Stages {
        downloader: Arc::new(FsDownloader::new(config.stages.blob_root.clone())),
        extractor: Arc::new(PlainTextExtractor),
        chunker: Arc::new(WindowChunker),
        embedder: http.clone(),
        indexer: http,
    })
}

async fn run() -> Result<(), DocflowError> {
    let config = load_worker_config()?;
    init_tracing(config.logging.format);

    let db_path = config.database.resolved_path();
    let db = Database::open(&db_path)?;
    let store = JobStore::new(db);

    let stages = build_stages(&config)?;
    let pipeline = Arc::new(Pipeline::new(
        stages,
        config.stages.timeouts.to_timeouts(),
        config.stages.chunk_params(),
    ));

    let (source, sender): (Arc<dyn JobSource>, Option<Arc<dyn MessageSender>>) =
        match config.channel.kind {
            ChannelKind::Polling => (
                Arc::new(PollingSource::new(store.clone(), config.worker.poll_interval())),
                None,
            ),
            ChannelKind::Memory => {
                // A fresh in-process queue holds none of the messages the
                // stored flags refer to.
                let cleared = store.clear_stale_enqueues(None, Duration::ZERO)?;
                if !cleared.is_empty() {
                    tracing::info!(count = cleared.len(), "Cleared enqueue flags from a previous run");
                }
                let queue = MemoryQueue::new(config.channel.memory_queue_config());
                (Arc::new(queue.clone()), Some(Arc::new(queue)))
            }
        };

    let leases = LeaseManager::new(store.clone());
    let gate = EnqueueGate::new(store.clone(), sender);
    let janitor = Janitor::new(store.clone(), Some(gate.clone()))
        .with_stale_enqueue_after(config.channel.stale_enqueue_after());
    let executor = Arc::new(Executor::new(
        leases,
        gate,
        pipeline,
        config.worker.executor_settings(),
    ));

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received");
        on_signal.cancel();
    })
    .map_err(|e| WorkerError::SignalHandler(e.to_string()))?;

    tracing::info!(
        database = %db_path.display(),
        channel = ?config.channel.kind,
        slots = config.worker.pool_settings().slots,
        "Worker starting"
    );
    if !config.worker.enable {
        tracing::warn!("Worker disabled by configuration, running janitor only");
    }

    let pool = WorkerPool::start(
        executor,
        source,
        Some(janitor),
        config.worker.pool_settings(),
        shutdown,
    );
    pool.wait().await?;

    tracing::info!("Worker stopped");
    Ok(())
}
