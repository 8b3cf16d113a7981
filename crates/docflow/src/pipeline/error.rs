use std::fmt;

use thiserror::Error;

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Download,
    Extract,
    Chunk,
    Embed,
    Index,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Download,
        Stage::Extract,
        Stage::Chunk,
        Stage::Embed,
        Stage::Index,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Download => "download",
            Stage::Extract => "extract",
            Stage::Chunk => "chunk",
            Stage::Embed => "embed",
            Stage::Index => "index",
        }
    }

    /// Progress reported when the stage starts.
    pub fn progress_percent(&self) -> u32 {
        match self {
            Stage::Download => 10,
            Stage::Extract => 30,
            Stage::Chunk => 50,
            Stage::Embed => 70,
            Stage::Index => 90,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stage collaborator failed.
///
/// Both kinds consume an attempt. `Transient` (network, timeout,
/// overload) may succeed on retry; `Permanent` (corrupt or unsupported
/// input) is expected to fail the same way every time.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StageError {
    #[error("{stage} failed (transient): {message}")]
    Transient { stage: Stage, message: String },

    #[error("{stage} failed: {message}")]
    Permanent { stage: Stage, message: String },
}

impl StageError {
    pub fn transient(stage: Stage, message: impl Into<String>) -> Self {
        StageError::Transient {
            stage,
            message: message.into(),
        }
    }

    pub fn permanent(stage: Stage, message: impl Into<String>) -> Self {
        StageError::Permanent {
            stage,
            message: message.into(),
        }
    }

    pub fn timeout(stage: Stage, after: std::time::Duration) -> Self {
        Self::transient(stage, format!("timed out after {}s", after.as_secs_f64()))
    }

    pub fn stage(&self) -> Stage {
        match self {
            StageError::Transient { stage, .. } | StageError::Permanent { stage, .. } => *stage,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StageError::Transient { .. })
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Stage(#[from] StageError),

    /// The lease was lost mid-run. Not a processing failure: no outcome
    /// is reported for it.
    #[error("Lease ownership lost")]
    OwnershipLost,
}
