//! Queue service over JetStream subjects.
//!
//! Every topic maps to one subject under `<stream>.`, and every topic has one
//! durable pull consumer shared by all workers hosting it, so messages for a
//! state are spread across its replicas.

use async_nats::jetstream::consumer::{pull::Config as ConsumerConfig, Consumer};
use async_nats::jetstream::{self, AckKind, Context};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;

use workflow_engine::queue::QueueResult;
use workflow_engine::{KeyedMessage, MessageQueue, QueueError, RetryPolicy};

use super::token;

/// JetStream-backed [`MessageQueue`].
pub struct JetStreamQueue {
    js: Context,
    stream: String,
    retry: RetryPolicy,
    consumers: Mutex<HashMap<String, Consumer<ConsumerConfig>>>,
}

impl JetStreamQueue {
    /// Open the queue, creating the stream if it does not exist yet.
    pub async fn open(js: Context, stream: &str) -> anyhow::Result<Self> {
        let stream_config = jetstream::stream::Config {
            name: stream.to_string(),
            subjects: vec![format!("{}.>", stream)],
            ..Default::default()
        };

        match js.get_stream(stream).await {
            Ok(_) => {
                tracing::debug!(stream = %stream, "Using existing NATS stream");
            }
            Err(_) => {
                js.create_stream(stream_config).await?;
                tracing::info!(stream = %stream, "Created NATS stream");
            }
        }

        Ok(Self {
            js,
            stream: stream.to_string(),
            retry: RetryPolicy::default(),
            consumers: Mutex::new(HashMap::new()),
        })
    }

    /// Subject a topic is published on.
    pub fn subject(&self, topic: &str) -> String {
        subject_for(&self.stream, topic)
    }

    /// Get or create the durable consumer of a topic.
    async fn consumer(&self, topic: &str) -> QueueResult<Consumer<ConsumerConfig>> {
        let mut consumers = self.consumers.lock().await;
        if let Some(consumer) = consumers.get(topic) {
            return Ok(consumer.clone());
        }

        let name = token(topic);
        let stream = self
            .js
            .get_stream(&self.stream)
            .await
            .map_err(transport)?;

        let consumer = match stream.get_consumer(&name).await {
            Ok(consumer) => consumer,
            Err(_) => {
                let consumer = stream
                    .create_consumer(ConsumerConfig {
                        durable_name: Some(name.clone()),
                        filter_subject: self.subject(topic),
                        ..Default::default()
                    })
                    .await
                    .map_err(transport)?;
                tracing::info!(topic = %topic, consumer = %name, "Created NATS consumer");
                consumer
            }
        };

        consumers.insert(topic.to_string(), consumer.clone());
        Ok(consumer)
    }
}

#[async_trait]
impl MessageQueue for JetStreamQueue {
    async fn add_message(
        &self,
        topic: &str,
        message: KeyedMessage,
        wait_for_ack: bool,
    ) -> QueueResult<()> {
        let subject = self.subject(topic);
        let payload =
            serde_json::to_vec(&message).map_err(|e| QueueError::Serialization(e.to_string()))?;

        let js = &self.js;
        let (subject_ref, payload_ref) = (&subject, &payload);
        self.retry
            .run("nats publish", move || async move {
                let ack = js
                    .publish(subject_ref.clone(), payload_ref.clone().into())
                    .await
                    .map_err(transport)?;
                if wait_for_ack {
                    ack.await.map_err(transport)?;
                }
                Ok::<_, QueueError>(())
            })
            .await?;

        tracing::debug!(topic = %topic, key = %message.key, "Message published");
        Ok(())
    }

    async fn get_message(&self, topic: &str, timeout: Duration) -> QueueResult<Option<KeyedMessage>> {
        let consumer = self.consumer(topic).await?;

        let mut messages = consumer
            .fetch()
            .max_messages(1)
            .expires(timeout)
            .messages()
            .await
            .map_err(transport)?;

        let Some(msg) = messages.next().await else {
            return Ok(None);
        };
        let msg = msg.map_err(transport)?;

        // Acked on receipt: an invocation is never replayed by the broker.
        match serde_json::from_slice::<KeyedMessage>(&msg.payload) {
            Ok(message) => {
                msg.ack().await.map_err(transport)?;
                Ok(Some(message))
            }
            Err(e) => {
                msg.ack_with(AckKind::Term).await.map_err(transport)?;
                Err(QueueError::Serialization(e.to_string()))
            }
        }
    }
}

impl std::fmt::Debug for JetStreamQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JetStreamQueue")
            .field("stream", &self.stream)
            .field("retry", &self.retry)
            .finish()
    }
}

fn subject_for(stream: &str, topic: &str) -> String {
    format!("{}.{}", stream, token(topic))
}

fn transport(e: impl std::fmt::Display) -> QueueError {
    QueueError::Transport(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_layout() {
        let subject = subject_for("workflow_states", "sb-wf-Hello");
        assert!(subject.starts_with("workflow_states._"));
        assert_eq!(subject.matches('.').count(), 1);
        assert_ne!(subject, subject_for("workflow_states", "sb-wf-Other"));
    }

    #[test]
    fn test_message_payload() {
        let message = KeyedMessage::new("exec-1", r#"{"value":1}"#);
        let payload = serde_json::to_vec(&message).unwrap();
        let parsed: KeyedMessage = serde_json::from_slice(&payload).unwrap();
        assert_eq!(parsed, message);
    }
}
