//! Stage adapter that delegates to a remote stage service over HTTP.
//!
//! Endpoints, all `POST` relative to the base URL:
//! `/download` (JSON in, raw bytes out), `/extract` (raw bytes in, JSON
//! out), `/embed`, `/index` and `/deindex` (JSON both ways).
//! Connection failures, timeouts, 429 and 5xx are transient; every other
//! non-success status is permanent.

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::ConfigError;

use super::error::{Stage, StageError};
use super::stages::{Chunk, Downloader, DocumentHint, Embedder, Extraction, Extractor, Indexer, Vector};

/// Longest response body quoted in an error.
const MAX_ERROR_BODY_LENGTH: usize = 200;

#[derive(Debug, Clone)]
pub struct HttpStages {
    http: Client,
    base_url: Url,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    vectors: Vec<Vector>,
}

#[derive(Serialize)]
struct IndexRequest<'a> {
    group_id: &'a str,
    job_id: &'a str,
    chunks: &'a [Chunk],
    vectors: &'a [Vector],
}

impl HttpStages {
    pub fn new(base_url: &str) -> Result<Self, ConfigError> {
        let base_url = Url::parse(base_url).map_err(|e| ConfigError::Validation {
            message: format!("Invalid stage service URL '{}': {}", base_url, e),
        })?;
        let http = Client::builder()
            .user_agent(concat!("docflow/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| ConfigError::Validation {
                message: format!("Failed to construct HTTP client: {}", e),
            })?;
        Ok(Self { http, base_url })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.as_str().trim_end_matches('/'), path)
    }

    async fn post_json(
        &self,
        stage: Stage,
        path: &str,
        body: &impl Serialize,
    ) -> Result<Response, StageError> {
        let response = self
            .http
            .post(self.endpoint(path))
            .json(body)
            .send()
            .await
            .map_err(|e| request_error(stage, e))?;
        check_status(stage, response).await
    }
}

fn request_error(stage: Stage, error: reqwest::Error) -> StageError {
    if error.is_builder() {
        StageError::permanent(stage, format!("invalid request: {}", error))
    } else {
        StageError::transient(stage, format!("stage service unreachable: {}", error))
    }
}

async fn check_status(stage: Stage, response: Response) -> Result<Response, StageError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let body: String = body.chars().take(MAX_ERROR_BODY_LENGTH).collect();
    let message = format!("stage service returned {}: {}", status, body);
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Err(StageError::transient(stage, message))
    } else {
        Err(StageError::permanent(stage, message))
    }
}

fn decode_error(stage: Stage, error: reqwest::Error) -> StageError {
    StageError::transient(stage, format!("malformed stage service response: {}", error))
}

#[async_trait]
impl Downloader for HttpStages {
    async fn download(&self, blob_ref: &str) -> Result<Vec<u8>, StageError> {
        let response = self
            .post_json(Stage::Download, "download", &json!({ "blob_ref": blob_ref }))
            .await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| decode_error(Stage::Download, e))?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl Extractor for HttpStages {
    async fn extract(&self, bytes: &[u8], hint: &DocumentHint) -> Result<Extraction, StageError> {
        let mut url = Url::parse(&self.endpoint("extract"))
            .map_err(|e| StageError::permanent(Stage::Extract, e.to_string()))?;
        if let Some(name) = &hint.file_name {
            url.query_pairs_mut().append_pair("file_name", name);
        }
        let content_type = hint
            .mime_type
            .clone()
            .unwrap_or_else(|| "application/octet-stream".to_string());

        let response = self
            .http
            .post(url)
            .header(CONTENT_TYPE, content_type)
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|e| request_error(Stage::Extract, e))?;
        let response = check_status(Stage::Extract, response).await?;
        response
            .json::<Extraction>()
            .await
            .map_err(|e| decode_error(Stage::Extract, e))
    }
}

#[async_trait]
impl Embedder for HttpStages {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vector>, StageError> {
        let response = self
            .post_json(Stage::Embed, "embed", &json!({ "texts": texts }))
            .await?;
        let body: EmbedResponse = response
            .json()
            .await
            .map_err(|e| decode_error(Stage::Embed, e))?;
        Ok(body.vectors)
    }
}

#[async_trait]
impl Indexer for HttpStages {
    async fn index(
        &self,
        group_id: &str,
        job_id: &str,
        chunks: &[Chunk],
        vectors: &[Vector],
    ) -> Result<(), StageError> {
        let request = IndexRequest {
            group_id,
            job_id,
            chunks,
            vectors,
        };
        self.post_json(Stage::Index, "index", &request).await?;
        Ok(())
    }

    async fn deindex(&self, group_id: &str, job_id: &str) -> Result<(), StageError> {
        self.post_json(
            Stage::Index,
            "deindex",
            &json!({ "group_id": group_id, "job_id": job_id }),
        )
        .await?;
        Ok(())
    }
}
