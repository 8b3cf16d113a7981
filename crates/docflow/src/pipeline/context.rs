use std::time::Duration;

use crate::jobs::Job;

use super::error::Stage;
use super::stages::{Chunk, DocumentHint, Extraction, Vector};

pub struct PipelineContext {
    // Input
    pub job_id: String,
    pub group_id: String,
    pub blob_ref: String,
    pub attempt: u32,
    pub hint: DocumentHint,

    // Download result; the bytes themselves are dropped after extraction
    pub downloaded_bytes: usize,

    // Extract result
    pub extraction: Option<Extraction>,

    // Chunk result
    pub chunks: Vec<Chunk>,

    // Embed result, parallel to `chunks`
    pub vectors: Vec<Vector>,

    // Wall time per finished stage
    pub timings: Vec<(Stage, Duration)>,
}

impl PipelineContext {
    pub fn new(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            group_id: job.group_id.clone(),
            blob_ref: job.blob_ref.clone(),
            attempt: job.attempt_count,
            hint: DocumentHint::from_blob_ref(&job.blob_ref),
            downloaded_bytes: 0,
            extraction: None,
            chunks: Vec::new(),
            vectors: Vec::new(),
            timings: Vec::new(),
        }
    }

    pub fn completed_stages(&self) -> Vec<Stage> {
        self.timings.iter().map(|(stage, _)| *stage).collect()
    }
}
