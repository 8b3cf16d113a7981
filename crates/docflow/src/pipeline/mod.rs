pub mod context;
pub mod error;
pub mod http;
pub mod local;
pub mod progress;
pub mod runner;
pub mod stages;

pub use context::PipelineContext;
pub use error::{PipelineError, Stage, StageError};
pub use http::HttpStages;
pub use local::{FsDownloader, PlainTextExtractor, WindowChunker};
pub use progress::{ProgressReporter, StoreProgress};
pub use runner::{Pipeline, StageTimeouts};
pub use stages::{
    Chunk, ChunkParams, Chunker, DocumentHint, Downloader, Embedder, Extraction, Extractor,
    Indexer, PageSpan, Stages, Vector,
};
