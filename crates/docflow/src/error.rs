use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DocflowError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Enqueue error: {0}")]
    Enqueue(#[from] EnqueueError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Channel error: {0}")]
    Channel(#[from] crate::channel::ChannelError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Stage error: {0}")]
    Stage(#[from] crate::pipeline::StageError),
}

/// Startup-time configuration problems. Never raised per job.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },

    #[error("Invalid value '{value}' for environment variable {name}")]
    InvalidEnv { name: String, value: String },

    #[error("Missing collaborator: {0}")]
    MissingCollaborator(String),
}

#[derive(Error, Debug)]
pub enum EnqueueError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Failed to dispatch message for job {job_id}: {source}")]
    Dispatch {
        job_id: String,
        #[source]
        source: crate::channel::ChannelError,
    },

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to install signal handler: {0}")]
    SignalHandler(String),

    #[error("Worker task panicked: {0}")]
    Panicked(String),

    #[error("Job source failed: {0}")]
    Source(#[from] crate::channel::ChannelError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),
}

pub type Result<T> = std::result::Result<T, DocflowError>;
