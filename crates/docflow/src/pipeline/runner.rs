use std::future::Future;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument, Span};

use super::context::PipelineContext;
use super::error::{PipelineError, Stage, StageError};
use super::progress::ProgressReporter;
use super::stages::{ChunkParams, Stages};

/// Per-stage time limits. Owned by the runner, never by a collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTimeouts {
    pub download: Duration,
    pub extract: Duration,
    pub chunk: Duration,
    pub embed: Duration,
    pub index: Duration,
}

impl StageTimeouts {
    pub fn for_stage(&self, stage: Stage) -> Duration {
        match stage {
            Stage::Download => self.download,
            Stage::Extract => self.extract,
            Stage::Chunk => self.chunk,
            Stage::Embed => self.embed,
            Stage::Index => self.index,
        }
    }

    /// Same limit for every stage.
    pub fn uniform(limit: Duration) -> Self {
        Self {
            download: limit,
            extract: limit,
            chunk: limit,
            embed: limit,
            index: limit,
        }
    }
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            download: Duration::from_secs(60),
            extract: Duration::from_secs(600),
            chunk: Duration::from_secs(60),
            embed: Duration::from_secs(180),
            index: Duration::from_secs(60),
        }
    }
}

pub struct Pipeline {
    stages: Stages,
    timeouts: StageTimeouts,
    chunk_params: ChunkParams,
}

impl Pipeline {
    pub fn new(stages: Stages, timeouts: StageTimeouts, chunk_params: ChunkParams) -> Self {
        Self {
            stages,
            timeouts,
            chunk_params,
        }
    }

    pub fn stages(&self) -> &Stages {
        &self.stages
    }

    /// Runs download → extract → chunk → embed → index for one job.
    ///
    /// `lost` is checked before and after every stage. A stage already in
    /// flight is not interrupted, but once `lost` fires its result is
    /// discarded and `OwnershipLost` is returned.
    pub async fn run(
        &self,
        ctx: &mut PipelineContext,
        progress: &dyn ProgressReporter,
        lost: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let (bytes, elapsed) = self
            .step(
                Stage::Download,
                progress,
                lost,
                self.stages.downloader.download(&ctx.blob_ref),
            )
            .await?;
        ctx.timings.push((Stage::Download, elapsed));
        ctx.downloaded_bytes = bytes.len();

        let (extraction, elapsed) = self
            .step(
                Stage::Extract,
                progress,
                lost,
                self.stages.extractor.extract(&bytes, &ctx.hint),
            )
            .await?;
        drop(bytes);
        ctx.timings.push((Stage::Extract, elapsed));
        if extraction.text.trim().is_empty() {
            return Err(StageError::permanent(Stage::Extract, "No text extracted from document").into());
        }
        let extraction = ctx.extraction.insert(extraction);

        let (chunks, elapsed) = self
            .step(
                Stage::Chunk,
                progress,
                lost,
                self.stages
                    .chunker
                    .chunk(&extraction.text, &extraction.page_map, &self.chunk_params),
            )
            .await?;
        ctx.timings.push((Stage::Chunk, elapsed));
        if chunks.is_empty() {
            return Err(StageError::permanent(Stage::Chunk, "Document produced no chunks").into());
        }
        ctx.chunks = chunks;

        let texts: Vec<String> = ctx.chunks.iter().map(|c| c.text.clone()).collect();
        let (vectors, elapsed) = self
            .step(Stage::Embed, progress, lost, self.stages.embedder.embed(&texts))
            .await?;
        ctx.timings.push((Stage::Embed, elapsed));
        if vectors.len() != ctx.chunks.len() {
            return Err(StageError::permanent(
                Stage::Embed,
                format!(
                    "expected {} vectors, got {}",
                    ctx.chunks.len(),
                    vectors.len()
                ),
            )
            .into());
        }
        ctx.vectors = vectors;

        let ((), elapsed) = self
            .step(
                Stage::Index,
                progress,
                lost,
                self.stages
                    .indexer
                    .index(&ctx.group_id, &ctx.job_id, &ctx.chunks, &ctx.vectors),
            )
            .await?;
        ctx.timings.push((Stage::Index, elapsed));

        Ok(())
    }

    async fn step<T, F>(
        &self,
        stage: Stage,
        progress: &dyn ProgressReporter,
        lost: &CancellationToken,
        call: F,
    ) -> Result<(T, Duration), PipelineError>
    where
        F: Future<Output = Result<T, StageError>>,
    {
        if lost.is_cancelled() {
            return Err(PipelineError::OwnershipLost);
        }
        progress.report(stage.progress_percent(), stage.as_str());

        let limit = self.timeouts.for_stage(stage);
        let started = Instant::now();
        debug!(stage = %stage, "Stage started");
        let result = tokio::time::timeout(limit, call)
            .instrument(stage_span(stage))
            .await;
        let elapsed = started.elapsed();

        if lost.is_cancelled() {
            warn!(stage = %stage, "Lease lost during stage, discarding result");
            return Err(PipelineError::OwnershipLost);
        }

        match result {
            Ok(Ok(value)) => {
                debug!(stage = %stage, elapsed_ms = elapsed.as_millis() as u64, "Stage finished");
                Ok((value, elapsed))
            }
            Ok(Err(e)) => {
                warn!(stage = %stage, elapsed_ms = elapsed.as_millis() as u64, error = %e, "Stage failed");
                Err(e.into())
            }
            Err(_) => {
                warn!(stage = %stage, limit_secs = limit.as_secs(), "Stage timed out");
                Err(StageError::timeout(stage, limit).into())
            }
        }
    }
}

fn stage_span(stage: Stage) -> Span {
    match stage {
        Stage::Download => info_span!("download"),
        Stage::Extract => info_span!("extract"),
        Stage::Chunk => info_span!("chunk"),
        Stage::Embed => info_span!("embed"),
        Stage::Index => info_span!("index"),
    }
}
