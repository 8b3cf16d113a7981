//! Contracts for the pipeline stage collaborators.
//!
//! Collaborators are request/response capabilities. They never see a
//! lease or a timeout: the runner owns both.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::StageError;

/// What the extractor is told about the document besides its bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentHint {
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
}

impl DocumentHint {
    /// Derives the file name and guesses the MIME type from the last path
    /// segment of a blob reference.
    pub fn from_blob_ref(blob_ref: &str) -> Self {
        let trimmed = blob_ref.split(['?', '#']).next().unwrap_or(blob_ref);
        let file_name = Path::new(trimmed)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .filter(|n| !n.is_empty());
        let mime_type = file_name
            .as_deref()
            .and_then(|n| mime_guess::from_path(n).first())
            .map(|m| m.to_string());
        Self {
            file_name,
            mime_type,
        }
    }
}

/// Start of a page within the extracted text, as a byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageSpan {
    pub page: u32,
    pub start: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extraction {
    pub text: String,
    pub page_map: Vec<PageSpan>,
}

impl Extraction {
    /// Page containing byte offset `offset`. Defaults to page 1.
    pub fn page_at(page_map: &[PageSpan], offset: usize) -> u32 {
        page_map
            .iter()
            .take_while(|span| span.start <= offset)
            .last()
            .map_or(1, |span| span.page)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkParams {
    /// Window size in characters.
    pub size: usize,
    /// Characters shared between neighbouring windows.
    pub overlap: usize,
}

impl Default for ChunkParams {
    fn default() -> Self {
        Self {
            size: 1000,
            overlap: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub index: usize,
    pub text: String,
    /// Page the chunk starts on.
    pub page: u32,
}

pub type Vector = Vec<f32>;

#[async_trait]
pub trait Downloader: Send + Sync {
    async fn download(&self, blob_ref: &str) -> Result<Vec<u8>, StageError>;
}

#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, bytes: &[u8], hint: &DocumentHint) -> Result<Extraction, StageError>;
}

#[async_trait]
pub trait Chunker: Send + Sync {
    async fn chunk(
        &self,
        text: &str,
        page_map: &[PageSpan],
        params: &ChunkParams,
    ) -> Result<Vec<Chunk>, StageError>;
}

#[async_trait]
pub trait Embedder: Send + Sync {
    /// One vector per input text, in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vector>, StageError>;
}

#[async_trait]
pub trait Indexer: Send + Sync {
    async fn index(
        &self,
        group_id: &str,
        job_id: &str,
        chunks: &[Chunk],
        vectors: &[Vector],
    ) -> Result<(), StageError>;

    /// Removes every index entry written for the job.
    async fn deindex(&self, group_id: &str, job_id: &str) -> Result<(), StageError>;
}

/// The full set of collaborators a pipeline drives.
#[derive(Clone)]
pub struct Stages {
    pub downloader: Arc<dyn Downloader>,
    pub extractor: Arc<dyn Extractor>,
    pub chunker: Arc<dyn Chunker>,
    pub embedder: Arc<dyn Embedder>,
    pub indexer: Arc<dyn Indexer>,
}
