//! Test harness for executor and lifecycle tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use docflow::channel::{Delivery, JobMessage, MemoryQueue, MemoryQueueConfig, MessageSender};
use docflow::db::Database;
use docflow::jobs::{
    DeadLetterHandler, EnqueueGate, Janitor, Job, JobStore, LeaseManager, ManualClock, NewJob,
};
use docflow::pipeline::{
    Chunk, ChunkParams, Chunker, DocumentHint, Downloader, Embedder, Extraction, Extractor,
    Indexer, PageSpan, Pipeline, PlainTextExtractor, Stage, StageError, StageTimeouts, Stages,
    Vector, WindowChunker,
};
use docflow::worker::{Executor, ExecutorSettings};
use docflow::Coordinator;

/// Document body every scripted download returns: two pages.
pub const DOCUMENT: &[u8] = b"The quarterly report covers revenue.\x0cPage two lists the risks.";

/// Pipeline collaborators driven by a per-stage script.
///
/// Each stage pops its next scripted failure, if any, and otherwise
/// succeeds. Extraction and chunking use the real plain-text adapters.
#[derive(Default)]
pub struct ScriptedStages {
    failures: Mutex<HashMap<Stage, VecDeque<StageError>>>,
    delays: Mutex<HashMap<Stage, Duration>>,
    calls: Mutex<HashMap<Stage, usize>>,
    indexed: Mutex<Vec<(String, String, usize)>>,
    deindexed: Mutex<Vec<(String, String)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedStages {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queues one failure for the next call of `stage`.
    pub fn fail_next(&self, stage: Stage, error: StageError) {
        self.failures
            .lock()
            .unwrap()
            .entry(stage)
            .or_default()
            .push_back(error);
    }

    pub fn fail_transient(&self, stage: Stage, times: usize) {
        for _ in 0..times {
            self.fail_next(stage, StageError::transient(stage, "service unavailable"));
        }
    }

    pub fn fail_permanent(&self, stage: Stage, times: usize) {
        for _ in 0..times {
            self.fail_next(stage, StageError::permanent(stage, "corrupt input"));
        }
    }

    /// Every call of `stage` sleeps this long before answering.
    pub fn delay(&self, stage: Stage, by: Duration) {
        self.delays.lock().unwrap().insert(stage, by);
    }

    pub fn calls(&self, stage: Stage) -> usize {
        self.calls.lock().unwrap().get(&stage).copied().unwrap_or(0)
    }

    /// `(group_id, job_id, chunk_count)` per successful index call.
    pub fn indexed(&self) -> Vec<(String, String, usize)> {
        self.indexed.lock().unwrap().clone()
    }

    pub fn deindexed(&self) -> Vec<(String, String)> {
        self.deindexed.lock().unwrap().clone()
    }

    /// Highest number of downloads observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn stages(self: &Arc<Self>) -> Stages {
        Stages {
            downloader: self.clone(),
            extractor: self.clone(),
            chunker: self.clone(),
            embedder: self.clone(),
            indexer: self.clone(),
        }
    }

    async fn enter(&self, stage: Stage) -> Result<(), StageError> {
        *self.calls.lock().unwrap().entry(stage).or_default() += 1;
        let delay = self.delays.lock().unwrap().get(&stage).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&stage)
            .and_then(|q| q.pop_front());
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Downloader for ScriptedStages {
    async fn download(&self, _blob_ref: &str) -> Result<Vec<u8>, StageError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let result = self.enter(Stage::Download).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result.map(|()| DOCUMENT.to_vec())
    }
}

#[async_trait]
impl Extractor for ScriptedStages {
    async fn extract(&self, bytes: &[u8], hint: &DocumentHint) -> Result<Extraction, StageError> {
        self.enter(Stage::Extract).await?;
        PlainTextExtractor.extract(bytes, hint).await
    }
}

#[async_trait]
impl Chunker for ScriptedStages {
    async fn chunk(
        &self,
        text: &str,
        page_map: &[PageSpan],
        params: &ChunkParams,
    ) -> Result<Vec<Chunk>, StageError> {
        self.enter(Stage::Chunk).await?;
        WindowChunker.chunk(text, page_map, params).await
    }
}

#[async_trait]
impl Embedder for ScriptedStages {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vector>, StageError> {
        self.enter(Stage::Embed).await?;
        Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
    }
}

#[async_trait]
impl Indexer for ScriptedStages {
    async fn index(
        &self,
        group_id: &str,
        job_id: &str,
        chunks: &[Chunk],
        _vectors: &[Vector],
    ) -> Result<(), StageError> {
        self.enter(Stage::Index).await?;
        self.indexed
            .lock()
            .unwrap()
            .push((group_id.to_string(), job_id.to_string(), chunks.len()));
        Ok(())
    }

    async fn deindex(&self, group_id: &str, job_id: &str) -> Result<(), StageError> {
        self.deindexed
            .lock()
            .unwrap()
            .push((group_id.to_string(), job_id.to_string()));
        Ok(())
    }
}

/// Everything an executor needs, over one in-memory database and a
/// manual clock for lease timestamps.
pub struct TestHarness {
    pub db: Database,
    pub clock: Arc<ManualClock>,
    pub store: JobStore,
    pub queue: Option<MemoryQueue>,
    pub stages: Arc<ScriptedStages>,
    pub settings: ExecutorSettings,
    pub timeouts: StageTimeouts,
}

impl TestHarness {
    /// Polling mode: no message channel.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Push mode over an in-memory broker.
    pub fn with_queue(config: MemoryQueueConfig) -> Self {
        Self::build(Some(MemoryQueue::new(config)))
    }

    fn build(queue: Option<MemoryQueue>) -> Self {
        let db = Database::open_in_memory().expect("Failed to open in-memory database");
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = JobStore::with_clock(db.clone(), clock.clone());
        Self {
            db,
            clock,
            store,
            queue,
            stages: ScriptedStages::new(),
            settings: ExecutorSettings::default(),
            timeouts: StageTimeouts::default(),
        }
    }

    pub fn sender(&self) -> Option<Arc<dyn MessageSender>> {
        self.queue
            .clone()
            .map(|q| Arc::new(q) as Arc<dyn MessageSender>)
    }

    pub fn leases(&self) -> LeaseManager {
        LeaseManager::new(self.store.clone())
    }

    pub fn gate(&self) -> EnqueueGate {
        EnqueueGate::new(self.store.clone(), self.sender())
    }

    pub fn dead_letter(&self) -> DeadLetterHandler {
        DeadLetterHandler::new(self.store.clone())
    }

    pub fn janitor(&self) -> Janitor {
        Janitor::new(self.store.clone(), Some(self.gate()))
    }

    pub fn coordinator(&self) -> Coordinator {
        Coordinator::with_clock(
            self.db.clone(),
            self.clock.clone(),
            self.sender(),
            self.stages.clone(),
        )
    }

    pub fn pipeline(&self) -> Arc<Pipeline> {
        Arc::new(Pipeline::new(
            self.stages.stages(),
            self.timeouts,
            ChunkParams { size: 40, overlap: 10 },
        ))
    }

    pub fn executor(&self) -> Executor {
        Executor::new(
            self.leases(),
            self.gate(),
            self.pipeline(),
            self.settings,
        )
    }

    pub fn create(&self, new: NewJob) -> Job {
        self.store.create(new).expect("Failed to create job")
    }

    pub fn job(&self, id: &str) -> Job {
        self.store
            .get(id)
            .expect("Failed to read job")
            .expect("Job should exist")
    }

    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }

    /// A polled delivery for `job`, as the polling source would produce.
    pub fn polled(&self, job: &Job) -> Delivery {
        Delivery::polled(JobMessage::new(&job.group_id, &job.id))
    }
}
