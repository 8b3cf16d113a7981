//! In-process stage adapters for plain files and plain text.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;

use super::error::{Stage, StageError};
use super::stages::{
    Chunk, ChunkParams, Chunker, DocumentHint, Downloader, Extraction, Extractor, PageSpan,
};

/// Reads blobs from the local filesystem. A blob reference is a path or
/// a `file://` URL; relative paths resolve against `root` when set.
#[derive(Debug, Clone, Default)]
pub struct FsDownloader {
    root: Option<PathBuf>,
}

impl FsDownloader {
    pub fn new(root: Option<PathBuf>) -> Self {
        Self { root }
    }

    fn resolve(&self, blob_ref: &str) -> Result<PathBuf, StageError> {
        let raw = blob_ref.strip_prefix("file://").unwrap_or(blob_ref);
        let path = Path::new(raw);
        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(StageError::permanent(
                Stage::Download,
                format!("blob reference escapes its root: {}", blob_ref),
            ));
        }
        Ok(match &self.root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        })
    }
}

#[async_trait]
impl Downloader for FsDownloader {
    async fn download(&self, blob_ref: &str) -> Result<Vec<u8>, StageError> {
        let path = self.resolve(blob_ref)?;
        tokio::fs::read(&path).await.map_err(|e| {
            let message = format!("{}: {}", path.display(), e);
            match e.kind() {
                ErrorKind::NotFound | ErrorKind::PermissionDenied | ErrorKind::InvalidInput => {
                    StageError::permanent(Stage::Download, message)
                }
                _ => StageError::transient(Stage::Download, message),
            }
        })
    }
}

/// Decodes UTF-8 text. Form feeds separate pages.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainTextExtractor;

impl PlainTextExtractor {
    fn accepts(hint: &DocumentHint) -> bool {
        match hint.mime_type.as_deref() {
            None => true,
            Some(mime) => {
                mime.starts_with("text/") || mime == "application/json" || mime == "application/xml"
            }
        }
    }
}

#[async_trait]
impl Extractor for PlainTextExtractor {
    async fn extract(&self, bytes: &[u8], hint: &DocumentHint) -> Result<Extraction, StageError> {
        if !Self::accepts(hint) {
            return Err(StageError::permanent(
                Stage::Extract,
                format!(
                    "unsupported document type {}",
                    hint.mime_type.as_deref().unwrap_or("unknown")
                ),
            ));
        }
        let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
        let raw = std::str::from_utf8(bytes).map_err(|e| {
            StageError::permanent(Stage::Extract, format!("document is not valid UTF-8: {}", e))
        })?;

        let mut text = String::with_capacity(raw.len());
        let mut page_map = Vec::new();
        for (i, page) in raw.split('\u{000C}').enumerate() {
            if i > 0 {
                text.push('\n');
            }
            page_map.push(PageSpan {
                page: i as u32 + 1,
                start: text.len(),
            });
            text.push_str(page);
        }
        Ok(Extraction { text, page_map })
    }
}

/// Fixed-size character windows with overlap.
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowChunker;

#[async_trait]
impl Chunker for WindowChunker {
    async fn chunk(
        &self,
        text: &str,
        page_map: &[PageSpan],
        params: &ChunkParams,
    ) -> Result<Vec<Chunk>, StageError> {
        if params.size == 0 || params.overlap >= params.size {
            return Err(StageError::permanent(
                Stage::Chunk,
                format!(
                    "invalid chunk parameters: size {} overlap {}",
                    params.size, params.overlap
                ),
            ));
        }

        let bounds: Vec<usize> = text
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(text.len()))
            .collect();
        let char_count = bounds.len() - 1;
        let step = params.size - params.overlap;

        let mut chunks = Vec::new();
        let mut start = 0;
        while start < char_count {
            let end = (start + params.size).min(char_count);
            let window = text[bounds[start]..bounds[end]].trim();
            if !window.is_empty() {
                chunks.push(Chunk {
                    index: chunks.len(),
                    text: window.to_string(),
                    page: Extraction::page_at(page_map, bounds[start]),
                });
            }
            if end == char_count {
                break;
            }
            start += step;
        }
        Ok(chunks)
    }
}
