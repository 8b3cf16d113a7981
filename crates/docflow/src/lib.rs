pub mod channel;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod jobs;
pub mod pipeline;
pub mod telemetry;
pub mod worker;

pub use channel::{Delivery, JobMessage, JobSource, MemoryQueue, MessageSender, PollingSource};
pub use config::{load_config, WorkerConfig};
pub use coordinator::Coordinator;
pub use db::Database;
pub use error::{ConfigError, DocflowError, EnqueueError, Result, WorkerError};
pub use jobs::{
    DeadLetterHandler, EnqueueGate, EnqueueOutcome, Janitor, Job, JobStatus, JobStore,
    LeaseManager, NewJob, RecoverTarget,
};
pub use pipeline::{Pipeline, PipelineContext, Stages};
pub use telemetry::{init_tracing, LogFormat};
pub use worker::{Executor, WorkerPool};
