use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::job_repo::JobRow;
use crate::db::DatabaseError;

/// Longest diagnostic stored in `last_error`, in characters.
pub const MAX_ERROR_CHARS: usize = 1000;

/// Default retry budget for new jobs.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        match self {
            JobStatus::Completed | JobStatus::Failed => true,
            JobStatus::Queued | JobStatus::Processing => false,
        }
    }

    /// Status a processing job lands in when it is handed back to the
    /// pool, either by a failure report or by lease reclaim. Mirrors the
    /// `CASE` in `job_repo::return_to_pool`.
    pub fn after_return(attempt_count: u32, max_attempts: u32) -> Self {
        if attempt_count >= max_attempts {
            JobStatus::Failed
        } else {
            JobStatus::Queued
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An exclusive, time-bound claim on a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Lease {
    pub owner_token: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// A document-processing job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    pub id: String,
    pub group_id: String,
    pub blob_ref: String,
    pub status: JobStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub lease: Option<Lease>,
    pub message_enqueued_at: Option<DateTime<Utc>>,
    pub progress_percent: u32,
    pub progress_detail: Option<String>,
    pub last_error: Option<String>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub dead_lettered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Failed jobs are the quarantine; they stay out of claim eligibility
    /// until recovered.
    pub fn is_quarantined(&self) -> bool {
        self.status == JobStatus::Failed
    }
}

impl TryFrom<JobRow> for Job {
    type Error = DatabaseError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let id = row.id.clone();
        let corrupt = |reason: String| DatabaseError::CorruptRow {
            id: id.clone(),
            reason,
        };

        let status = JobStatus::parse(&row.status)
            .ok_or_else(|| corrupt(format!("unknown status '{}'", row.status)))?;

        let lease = match (row.lease_owner_token, row.lease_expires_at) {
            (Some(owner_token), Some(expires_at)) => Some(Lease {
                owner_token,
                expires_at: parse_timestamp(&expires_at).map_err(&corrupt)?,
            }),
            (None, None) => None,
            _ => return Err(corrupt("half-written lease".to_string())),
        };

        let optional = |value: Option<String>| -> Result<Option<DateTime<Utc>>, DatabaseError> {
            value
                .map(|v| parse_timestamp(&v).map_err(&corrupt))
                .transpose()
        };

        Ok(Job {
            status,
            attempt_count: row.attempt_count,
            max_attempts: row.max_attempts,
            lease,
            message_enqueued_at: optional(row.message_enqueued_at)?,
            progress_percent: row.progress_percent,
            progress_detail: row.progress_detail,
            last_error: row.last_error,
            processing_started_at: optional(row.processing_started_at)?,
            completed_at: optional(row.completed_at)?,
            dead_lettered_at: optional(row.dead_lettered_at)?,
            created_at: parse_timestamp(&row.created_at).map_err(&corrupt)?,
            updated_at: parse_timestamp(&row.updated_at).map_err(&corrupt)?,
            id: row.id,
            group_id: row.group_id,
            blob_ref: row.blob_ref,
        })
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("bad timestamp '{}': {}", value, e))
}

/// Input for creating a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: String,
    pub group_id: String,
    pub blob_ref: String,
    pub max_attempts: u32,
}

impl NewJob {
    pub fn new(
        id: impl Into<String>,
        group_id: impl Into<String>,
        blob_ref: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            group_id: group_id.into(),
            blob_ref: blob_ref.into(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

/// Per-status job counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub queued: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

impl StatusCounts {
    pub(crate) fn add(&mut self, status: JobStatus, count: u64) {
        match status {
            JobStatus::Queued => self.queued += count,
            JobStatus::Processing => self.processing += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
        }
    }
}

/// Truncates a diagnostic to `MAX_ERROR_CHARS` characters.
pub fn truncate_error(message: &str) -> String {
    match message.char_indices().nth(MAX_ERROR_CHARS) {
        Some((byte_idx, _)) => message[..byte_idx].to_string(),
        None => message.to_string(),
    }
}
