use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::channel::MemoryQueueConfig;
use crate::pipeline::{ChunkParams, StageTimeouts};
use crate::telemetry::LogFormat;
use crate::worker::{ExecutorSettings, PoolSettings};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub version: String,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub worker: WorkerSettings,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub stages: StagesConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            database: DatabaseConfig::default(),
            worker: WorkerSettings::default(),
            channel: ChannelConfig::default(),
            stages: StagesConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Defaults to `~/.docflow/data/docflow.db`.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl DatabaseConfig {
    pub fn resolved_path(&self) -> PathBuf {
        match &self.path {
            Some(path) => path.clone(),
            None => crate::db::default_database_path()
                .unwrap_or_else(|| PathBuf::from("docflow.db")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    /// `false` runs only the janitor.
    #[serde(default = "default_true")]
    pub enable: bool,
    #[serde(default = "default_slots")]
    pub slots: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_lease_duration_secs")]
    pub lease_duration_secs: u64,
    #[serde(default = "default_renew_interval_secs")]
    pub renew_interval_secs: u64,
    #[serde(default = "default_janitor_interval_secs")]
    pub janitor_interval_secs: u64,
    #[serde(default)]
    pub retry_via_redelivery: bool,
}

fn default_true() -> bool {
    true
}

fn default_slots() -> usize {
    1
}

fn default_batch_size() -> usize {
    1
}

fn default_poll_interval_secs() -> u64 {
    10
}

fn default_lease_duration_secs() -> u64 {
    300
}

fn default_renew_interval_secs() -> u64 {
    120
}

fn default_janitor_interval_secs() -> u64 {
    60
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            enable: true,
            slots: default_slots(),
            batch_size: default_batch_size(),
            poll_interval_secs: default_poll_interval_secs(),
            lease_duration_secs: default_lease_duration_secs(),
            renew_interval_secs: default_renew_interval_secs(),
            janitor_interval_secs: default_janitor_interval_secs(),
            retry_via_redelivery: false,
        }
    }
}

impl WorkerSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            lease_duration: Duration::from_secs(self.lease_duration_secs),
            renew_interval: Duration::from_secs(self.renew_interval_secs),
            retry_via_redelivery: self.retry_via_redelivery,
        }
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            slots: if self.enable { self.slots } else { 0 },
            batch_size: self.batch_size,
            janitor_interval: Duration::from_secs(self.janitor_interval_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// Workers poll the job store.
    #[default]
    Polling,
    /// In-process broker; the janitor dispatches queued jobs into it.
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(default)]
    pub kind: ChannelKind,
    #[serde(default = "default_max_delivery_count")]
    pub max_delivery_count: u32,
    #[serde(default = "default_lock_duration_secs")]
    pub lock_duration_secs: u64,
    #[serde(default = "default_receive_wait_secs")]
    pub receive_wait_secs: u64,
    /// How long a queued job's message may stay outstanding before the
    /// janitor gives up on it and dispatches again. Defaults to
    /// `lock_duration_secs * max_delivery_count`.
    #[serde(default)]
    pub stale_enqueue_secs: Option<u64>,
}

fn default_max_delivery_count() -> u32 {
    10
}

fn default_lock_duration_secs() -> u64 {
    300
}

fn default_receive_wait_secs() -> u64 {
    30
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            kind: ChannelKind::Polling,
            max_delivery_count: default_max_delivery_count(),
            lock_duration_secs: default_lock_duration_secs(),
            receive_wait_secs: default_receive_wait_secs(),
            stale_enqueue_secs: None,
        }
    }
}

impl ChannelConfig {
    pub fn memory_queue_config(&self) -> MemoryQueueConfig {
        MemoryQueueConfig {
            lock_duration: Duration::from_secs(self.lock_duration_secs),
            max_delivery_count: self.max_delivery_count,
            receive_wait: Duration::from_secs(self.receive_wait_secs),
        }
    }

    pub fn stale_enqueue_after(&self) -> Duration {
        let secs = self.stale_enqueue_secs.unwrap_or_else(|| {
            self.lock_duration_secs
                .saturating_mul(u64::from(self.max_delivery_count))
        });
        Duration::from_secs(secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagesConfig {
    /// Base URL of the embed/index service.
    #[serde(default)]
    pub service_url: Option<String>,
    /// Root for relative blob references read from disk.
    #[serde(default)]
    pub blob_root: Option<PathBuf>,
    #[serde(default)]
    pub timeouts: StageTimeoutsConfig,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

fn default_chunk_size() -> usize {
    1000
}

fn default_chunk_overlap() -> usize {
    200
}

impl Default for StagesConfig {
    fn default() -> Self {
        Self {
            service_url: None,
            blob_root: None,
            timeouts: StageTimeoutsConfig::default(),
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

impl StagesConfig {
    pub fn chunk_params(&self) -> ChunkParams {
        ChunkParams {
            size: self.chunk_size,
            overlap: self.chunk_overlap,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTimeoutsConfig {
    #[serde(default = "default_download_secs")]
    pub download_secs: u64,
    #[serde(default = "default_extract_secs")]
    pub extract_secs: u64,
    #[serde(default = "default_chunk_secs")]
    pub chunk_secs: u64,
    #[serde(default = "default_embed_secs")]
    pub embed_secs: u64,
    #[serde(default = "default_index_secs")]
    pub index_secs: u64,
}

fn default_download_secs() -> u64 {
    60
}

fn default_extract_secs() -> u64 {
    600
}

fn default_chunk_secs() -> u64 {
    60
}

fn default_embed_secs() -> u64 {
    180
}

fn default_index_secs() -> u64 {
    60
}

impl Default for StageTimeoutsConfig {
    fn default() -> Self {
        Self {
            download_secs: default_download_secs(),
            extract_secs: default_extract_secs(),
            chunk_secs: default_chunk_secs(),
            embed_secs: default_embed_secs(),
            index_secs: default_index_secs(),
        }
    }
}

impl StageTimeoutsConfig {
    pub fn to_timeouts(&self) -> StageTimeouts {
        StageTimeouts {
            download: Duration::from_secs(self.download_secs),
            extract: Duration::from_secs(self.extract_secs),
            chunk: Duration::from_secs(self.chunk_secs),
            embed: Duration::from_secs(self.embed_secs),
            index: Duration::from_secs(self.index_secs),
        }
    }

    pub(crate) fn as_list(&self) -> [(&'static str, u64); 5] {
        [
            ("download", self.download_secs),
            ("extract", self.extract_secs),
            ("chunk", self.chunk_secs),
            ("embed", self.embed_secs),
            ("index", self.index_secs),
        ]
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}
