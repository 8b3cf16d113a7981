use serde::{Deserialize, Serialize};

use super::ChannelError;

pub const DOCUMENT_PROCESSING: &str = "document_processing";

/// Queue message body. Carries only identifiers; the job row is the
/// source of truth for everything else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMessage {
    pub group_id: String,
    pub job_id: String,
    pub message_type: String,
}

impl JobMessage {
    pub fn new(group_id: impl Into<String>, job_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            job_id: job_id.into(),
            message_type: DOCUMENT_PROCESSING.to_string(),
        }
    }

    pub fn to_json(&self) -> Result<String, ChannelError> {
        serde_json::to_string(self).map_err(|e| ChannelError::Malformed(e.to_string()))
    }

    pub fn from_json(body: &str) -> Result<Self, ChannelError> {
        let message: JobMessage =
            serde_json::from_str(body).map_err(|e| ChannelError::Malformed(e.to_string()))?;
        if message.message_type != DOCUMENT_PROCESSING {
            return Err(ChannelError::Malformed(format!(
                "unexpected message_type '{}'",
                message.message_type
            )));
        }
        if message.job_id.is_empty() {
            return Err(ChannelError::Malformed("empty job_id".to_string()));
        }
        Ok(message)
    }
}
