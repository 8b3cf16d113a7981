//! In-process message broker with peek-lock semantics.
//!
//! A received message stays in the queue, locked for `lock_duration`.
//! `ack` removes it, `abandon` unlocks it, and a lock that simply runs out
//! makes the message visible again (at-least-once delivery). Each delivery
//! bumps the message's delivery count; once it reaches
//! `max_delivery_count` the message is moved to the dead-letter sub-queue
//! instead of being delivered again.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{ChannelError, Delivery, JobMessage, JobSource, MessageHandle, MessageSender};

#[derive(Debug, Clone)]
pub struct MemoryQueueConfig {
    pub lock_duration: Duration,
    pub max_delivery_count: u32,
    /// How long `receive` waits for a message before returning empty.
    pub receive_wait: Duration,
}

impl Default for MemoryQueueConfig {
    fn default() -> Self {
        Self {
            lock_duration: Duration::from_secs(60),
            max_delivery_count: 10,
            receive_wait: Duration::from_secs(30),
        }
    }
}

#[derive(Clone)]
pub struct MemoryQueue {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<QueueState>,
    notify: Notify,
    config: MemoryQueueConfig,
}

#[derive(Default)]
struct QueueState {
    next_seq: u64,
    next_lock: u64,
    messages: BTreeMap<u64, Stored>,
    dead_letters: Vec<Stored>,
    closed: bool,
}

struct Stored {
    body: String,
    delivery_count: u32,
    lock: Option<MessageLock>,
}

struct MessageLock {
    token: u64,
    until: Instant,
}

impl Shared {
    fn lock(&self) -> Result<MutexGuard<'_, QueueState>, ChannelError> {
        self.state
            .lock()
            .map_err(|_| ChannelError::Broker("queue state poisoned".to_string()))
    }
}

impl QueueState {
    fn push(&mut self, body: String) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.messages.insert(
            seq,
            Stored {
                body,
                delivery_count: 0,
                lock: None,
            },
        );
    }
}

impl MemoryQueue {
    pub fn new(config: MemoryQueueConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                config,
            }),
        }
    }

    pub fn config(&self) -> &MemoryQueueConfig {
        &self.shared.config
    }

    /// Enqueues a raw body without validating it.
    pub fn send_raw(&self, body: impl Into<String>) -> Result<(), ChannelError> {
        let mut state = self.shared.lock()?;
        if state.closed {
            return Err(ChannelError::Closed);
        }
        state.push(body.into());
        drop(state);
        self.shared.notify.notify_waiters();
        Ok(())
    }

    /// Messages still in the queue, locked or not.
    pub fn len(&self) -> usize {
        self.shared.lock().map(|s| s.messages.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dead_letter_count(&self) -> usize {
        self.shared.lock().map(|s| s.dead_letters.len()).unwrap_or(0)
    }

    /// Bodies in the dead-letter sub-queue.
    pub fn dead_letters(&self) -> Vec<String> {
        self.shared
            .lock()
            .map(|s| s.dead_letters.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    /// Moves every dead-lettered message back to the main queue with a
    /// fresh delivery count. Returns how many were moved.
    pub fn recover_dead_letters(&self) -> Result<usize, ChannelError> {
        let mut state = self.shared.lock()?;
        let dead = std::mem::take(&mut state.dead_letters);
        let moved = dead.len();
        for message in dead {
            state.push(message.body);
        }
        drop(state);
        if moved > 0 {
            tracing::info!(moved, "Recovered dead-lettered messages");
            self.shared.notify.notify_waiters();
        }
        Ok(moved)
    }

    /// Stops accepting and delivering messages. Pending receivers return
    /// `ChannelError::Closed`.
    pub fn close(&self) {
        if let Ok(mut state) = self.shared.lock() {
            state.closed = true;
        }
        self.shared.notify.notify_waiters();
    }

    /// Locks up to `max` visible messages. Malformed bodies are dropped
    /// on the spot. Returns the batch and the earliest instant at which a
    /// currently locked message becomes visible again.
    fn take_batch(&self, max: usize) -> Result<(Vec<Delivery>, Option<Instant>), ChannelError> {
        let now = Instant::now();
        let config = &self.shared.config;
        let mut state = self.shared.lock()?;
        if state.closed {
            return Err(ChannelError::Closed);
        }

        let QueueState {
            messages,
            next_lock,
            dead_letters,
            ..
        } = &mut *state;

        let mut batch = Vec::new();
        let mut next_unlock: Option<Instant> = None;
        let mut exhausted = Vec::new();
        let mut poison = Vec::new();

        for (seq, message) in messages.iter_mut() {
            if batch.len() >= max {
                break;
            }
            if let Some(lock) = &message.lock {
                if lock.until > now {
                    next_unlock = Some(next_unlock.map_or(lock.until, |t| t.min(lock.until)));
                    continue;
                }
            }
            if message.delivery_count >= config.max_delivery_count {
                exhausted.push(*seq);
                continue;
            }
            let parsed = match JobMessage::from_json(&message.body) {
                Ok(parsed) => parsed,
                Err(e) => {
                    tracing::warn!(seq, error = %e, "Dropping unparseable message");
                    poison.push(*seq);
                    continue;
                }
            };

            message.delivery_count += 1;
            let token = *next_lock;
            *next_lock += 1;
            message.lock = Some(MessageLock {
                token,
                until: now + config.lock_duration,
            });

            batch.push(Delivery {
                message: parsed,
                handle: Some(Arc::new(MemoryHandle {
                    shared: Arc::clone(&self.shared),
                    seq: *seq,
                    token,
                })),
            });
        }

        for seq in poison {
            messages.remove(&seq);
        }
        for seq in exhausted {
            if let Some(message) = messages.remove(&seq) {
                tracing::warn!(
                    seq,
                    deliveries = message.delivery_count,
                    "Message exceeded max delivery count, moving to dead-letter queue"
                );
                dead_letters.push(message);
            }
        }

        Ok((batch, next_unlock))
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(MemoryQueueConfig::default())
    }
}

impl std::fmt::Debug for MemoryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryQueue")
            .field("config", &self.shared.config)
            .field("len", &self.len())
            .finish()
    }
}

#[async_trait]
impl MessageSender for MemoryQueue {
    async fn send(&self, message: &JobMessage) -> Result<(), ChannelError> {
        self.send_raw(message.to_json()?)
    }
}

#[async_trait]
impl JobSource for MemoryQueue {
    async fn receive(&self, max: usize) -> Result<Vec<Delivery>, ChannelError> {
        let deadline = Instant::now() + self.shared.config.receive_wait;
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (batch, next_unlock) = self.take_batch(max.max(1))?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }

            let wake_at = next_unlock.map_or(deadline, |t| t.min(deadline));
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

struct MemoryHandle {
    shared: Arc<Shared>,
    seq: u64,
    token: u64,
}

impl MemoryHandle {
    /// Runs `f` on the message if this handle still holds a live lock.
    fn with_held<T>(&self, f: impl FnOnce(&mut QueueState) -> T) -> Result<T, ChannelError> {
        let mut state = self.shared.lock()?;
        let held = state
            .messages
            .get(&self.seq)
            .and_then(|m| m.lock.as_ref())
            .map_or(false, |l| l.token == self.token && l.until > Instant::now());
        if !held {
            return Err(ChannelError::Broker(format!(
                "lock lost for message {}",
                self.seq
            )));
        }
        Ok(f(&mut state))
    }
}

#[async_trait]
impl MessageHandle for MemoryHandle {
    async fn ack(&self) -> Result<(), ChannelError> {
        self.with_held(|state| {
            state.messages.remove(&self.seq);
        })
    }

    async fn abandon(&self) -> Result<(), ChannelError> {
        self.with_held(|state| {
            if let Some(message) = state.messages.get_mut(&self.seq) {
                message.lock = None;
            }
        })?;
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn renew_lock(&self, duration: Duration) -> Result<(), ChannelError> {
        let until = Instant::now() + duration;
        self.with_held(|state| {
            if let Some(lock) = state
                .messages
                .get_mut(&self.seq)
                .and_then(|m| m.lock.as_mut())
            {
                lock.until = until;
            }
        })
    }
}
