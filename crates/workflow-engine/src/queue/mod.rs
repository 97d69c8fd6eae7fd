//! Queue service contract.

mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub use memory::MemoryQueue;

/// Message key reserved for worker control messages.
pub const CONTROL_MESSAGE_KEY: &str = "0l";

/// Errors returned by a queue backend.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Backend could not be reached after retries.
    #[error("Queue transport error: {0}")]
    Transport(String),

    /// Message could not be encoded or decoded.
    #[error("Queue serialization error: {0}")]
    Serialization(String),
}

/// Result alias for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// A keyed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyedMessage {
    pub key: String,
    pub value: String,
}

impl KeyedMessage {
    /// Create a message.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Whether this is a worker control message.
    pub fn is_control(&self) -> bool {
        self.key == CONTROL_MESSAGE_KEY
    }
}

/// Queue service operations.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Enqueue a message, optionally waiting for the broker to acknowledge it.
    async fn add_message(
        &self,
        topic: &str,
        message: KeyedMessage,
        wait_for_ack: bool,
    ) -> QueueResult<()>;

    /// Receive the next message, or `None` once `timeout` elapses.
    async fn get_message(&self, topic: &str, timeout: Duration) -> QueueResult<Option<KeyedMessage>>;
}
