//! Job sources: where the executor gets its next job from.
//!
//! Two implementations share the `JobSource` trait. `PollingSource` reads
//! queued rows straight from the job store on a fixed interval.
//! `MemoryQueue` is a push-style broker with per-message locks and
//! at-least-once redelivery. The executor does not care which one it is
//! driven by; redelivered duplicates are resolved by the lease, never by
//! the channel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub mod memory;
pub mod message;
pub mod polling;

pub use memory::{MemoryQueue, MemoryQueueConfig};
pub use message::JobMessage;
pub use polling::PollingSource;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Channel is closed")]
    Closed,

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),
}

/// Settlement operations on one received message.
#[async_trait]
pub trait MessageHandle: Send + Sync {
    /// Removes the message for good.
    async fn ack(&self) -> Result<(), ChannelError>;

    /// Releases the lock so the message is redelivered.
    async fn abandon(&self) -> Result<(), ChannelError>;

    /// Extends the lock from now.
    async fn renew_lock(&self, duration: Duration) -> Result<(), ChannelError>;
}

/// One unit of work handed to the executor.
pub struct Delivery {
    pub message: JobMessage,
    /// `None` when the job came from polling.
    pub handle: Option<Arc<dyn MessageHandle>>,
}

impl Delivery {
    pub fn polled(message: JobMessage) -> Self {
        Self {
            message,
            handle: None,
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .field("has_handle", &self.handle.is_some())
            .finish()
    }
}

#[async_trait]
pub trait JobSource: Send + Sync {
    /// Waits for up to `max` deliveries. An empty batch means nothing
    /// arrived within the source's wait window; call again.
    async fn receive(&self, max: usize) -> Result<Vec<Delivery>, ChannelError>;

    fn name(&self) -> &'static str;
}

/// Outbound side used by the enqueue gate.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, message: &JobMessage) -> Result<(), ChannelError>;
}
