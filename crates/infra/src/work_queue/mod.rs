//! Pending-work queue: the transport between job planning and execution units.
//!
//! Delivery is at-least-once. A received message stays on the queue (hidden
//! from other receivers) until it is acknowledged or dead-lettered through the
//! receipt handle of that specific delivery. Unacknowledged messages become
//! visible again and are redelivered.
//!
//! ## Implementations
//!
//! - `InMemoryWorkQueue`: visibility-timeout queue for tests/dev
//! - `RedisStreamsWorkQueue`: durable Redis Streams consumer group (feature `redis`)

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis_streams;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use lakepurge_core::QueueVisibility;

pub use in_memory::{DeadLetteredMessage, InMemoryWorkQueue};
#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsLauncher, RedisStreamsWorkQueue};

/// Opaque token identifying one delivery of a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReceiptHandle(String);

impl ReceiptHandle {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message as delivered by [`WorkQueue::receive`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkQueueMessage {
    /// Raw body, expected to be a JSON object.
    pub body: String,
    pub receipt_handle: ReceiptHandle,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkQueueError {
    #[error("queue connection error: {0}")]
    Connection(String),

    #[error("queue command error: {0}")]
    Command(String),

    /// The handle does not name a current delivery (already acknowledged, or redelivered since).
    #[error("unknown receipt handle: {0}")]
    UnknownReceipt(ReceiptHandle),

    #[error("queue state error: {0}")]
    State(String),
}

/// At-least-once pending-work queue.
pub trait WorkQueue: Send + Sync {
    /// Append a message body.
    fn send(&self, body: &str) -> Result<(), WorkQueueError>;

    /// Receive up to `max` messages, waiting at most `wait` for the first one.
    ///
    /// Returning fewer than `max` (or none) is not an error.
    fn receive(&self, max: usize, wait: Duration) -> Result<Vec<WorkQueueMessage>, WorkQueueError>;

    /// Remove the delivered message for good.
    fn acknowledge(&self, handle: &ReceiptHandle) -> Result<(), WorkQueueError>;

    /// Move the delivered message aside so it is never redelivered.
    fn dead_letter(&self, handle: &ReceiptHandle, reason: &str) -> Result<(), WorkQueueError>;

    /// Current waiting (visible) and in-flight (not visible) counts.
    fn visibility(&self) -> Result<QueueVisibility, WorkQueueError>;
}

impl<Q> WorkQueue for Arc<Q>
where
    Q: WorkQueue + ?Sized,
{
    fn send(&self, body: &str) -> Result<(), WorkQueueError> {
        (**self).send(body)
    }

    fn receive(&self, max: usize, wait: Duration) -> Result<Vec<WorkQueueMessage>, WorkQueueError> {
        (**self).receive(max, wait)
    }

    fn acknowledge(&self, handle: &ReceiptHandle) -> Result<(), WorkQueueError> {
        (**self).acknowledge(handle)
    }

    fn dead_letter(&self, handle: &ReceiptHandle, reason: &str) -> Result<(), WorkQueueError> {
        (**self).dead_letter(handle, reason)
    }

    fn visibility(&self) -> Result<QueueVisibility, WorkQueueError> {
        (**self).visibility()
    }
}
