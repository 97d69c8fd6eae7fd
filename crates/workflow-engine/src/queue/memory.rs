//! In-memory queue backend.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

use super::{KeyedMessage, MessageQueue, QueueResult};

/// Per-topic FIFO queues held in process memory.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    topics: Mutex<HashMap<String, VecDeque<KeyedMessage>>>,
    notify: Notify,
}

impl MemoryQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages waiting on a topic.
    pub async fn len(&self, topic: &str) -> usize {
        self.topics.lock().await.get(topic).map_or(0, VecDeque::len)
    }

    /// Remove and return everything waiting on a topic.
    pub async fn drain(&self, topic: &str) -> Vec<KeyedMessage> {
        self.topics
            .lock()
            .await
            .get_mut(topic)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default()
    }

    /// Pop one message from the first non-empty topic among `topics`.
    pub async fn try_pop_any(&self, topics: &[String]) -> Option<(String, KeyedMessage)> {
        let mut queues = self.topics.lock().await;
        for topic in topics {
            if let Some(message) = queues.get_mut(topic).and_then(VecDeque::pop_front) {
                return Some((topic.clone(), message));
            }
        }
        None
    }

    async fn try_pop(&self, topic: &str) -> Option<KeyedMessage> {
        self.topics
            .lock()
            .await
            .get_mut(topic)
            .and_then(VecDeque::pop_front)
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    async fn add_message(
        &self,
        topic: &str,
        message: KeyedMessage,
        _wait_for_ack: bool,
    ) -> QueueResult<()> {
        self.topics
            .lock()
            .await
            .entry(topic.to_string())
            .or_default()
            .push_back(message);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn get_message(&self, topic: &str, timeout: Duration) -> QueueResult<Option<KeyedMessage>> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(message) = self.try_pop(topic).await {
                return Ok(Some(message));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(self.try_pop(topic).await);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_fifo_per_topic() {
        let queue = MemoryQueue::new();
        queue.add_message("a", KeyedMessage::new("1", "x"), true).await.unwrap();
        queue.add_message("a", KeyedMessage::new("2", "y"), true).await.unwrap();
        queue.add_message("b", KeyedMessage::new("3", "z"), true).await.unwrap();

        let first = queue.get_message("a", Duration::from_millis(10)).await.unwrap();
        assert_eq!(first.unwrap().key, "1");
        assert_eq!(queue.len("a").await, 1);
        assert_eq!(queue.drain("b").await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_message_times_out() {
        let queue = MemoryQueue::new();
        let got = queue.get_message("empty", Duration::from_secs(1)).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_get_message_wakes_on_add() {
        let queue = Arc::new(MemoryQueue::new());
        let receiver = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get_message("t", Duration::from_secs(5)).await })
        };

        tokio::task::yield_now().await;
        queue.add_message("t", KeyedMessage::new("k", "v"), false).await.unwrap();

        let got = receiver.await.unwrap().unwrap();
        assert_eq!(got, Some(KeyedMessage::new("k", "v")));
    }

    #[test]
    fn test_control_key() {
        assert!(KeyedMessage::new("0l", "{}").is_control());
        assert!(!KeyedMessage::new("exec", "{}").is_control());
    }
}
