//! Worker lifecycle management.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;

use workflow_engine::{
    EngineConfig, ExecutionPipeline, FunctionParams, KeyedMessage, MessageQueue, TaskRegistry,
};

use crate::config::WorkerConfig;
use crate::nats::{self, JetStreamDataLayer, JetStreamQueue};

/// Control message carried on the state topic under the reserved key.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum ControlMessage {
    /// Leave the receive loop once in-flight invocations finish.
    Stop,

    /// Replace the set of topics routed through the local queue.
    UpdateLocalFunctions {
        #[serde(rename = "localFunctions")]
        local_functions: Vec<String>,
    },
}

/// Worker hosting one state; runs one pipeline pass per received message.
pub struct Worker {
    /// Worker configuration.
    config: WorkerConfig,

    /// Pipeline of the hosted state.
    pipeline: Arc<ExecutionPipeline>,

    /// Queue the state topic is read from.
    queue: Arc<dyn MessageQueue>,

    /// Topic of the hosted state.
    topic: String,

    /// Semaphore for concurrency control.
    semaphore: Arc<Semaphore>,
}

impl Worker {
    /// Create a worker over an existing pipeline and queue.
    pub fn new(
        config: WorkerConfig,
        pipeline: ExecutionPipeline,
        queue: Arc<dyn MessageQueue>,
    ) -> Self {
        let topic = pipeline.params().state_topic();
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));

        Self {
            config,
            pipeline: Arc::new(pipeline),
            queue,
            topic,
            semaphore,
        }
    }

    /// Connect to NATS and build the pipeline for `params`.
    pub async fn connect(
        config: WorkerConfig,
        params: FunctionParams,
        engine: EngineConfig,
        tasks: TaskRegistry,
    ) -> Result<Self> {
        let js = nats::connect(&config.nats_url).await?;
        let queue: Arc<dyn MessageQueue> =
            Arc::new(JetStreamQueue::open(js.clone(), &config.nats_stream).await?);
        let storage = Arc::new(JetStreamDataLayer::open(&js, &config.nats_kv_bucket).await?);

        let pipeline = ExecutionPipeline::new(params, engine, tasks, queue.clone(), storage)
            .context("Failed to build execution pipeline")?;

        Ok(Self::new(config, pipeline, queue))
    }

    /// Topic this worker consumes.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Run the worker until a stop control message arrives.
    pub async fn run(&self) -> Result<()> {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        tracing::info!(
            worker_id = %self.config.worker_id,
            hostname = %hostname,
            topic = %self.topic,
            state = %self.pipeline.definition().name,
            max_concurrent = self.config.max_concurrent,
            "Worker started"
        );

        self.process_messages().await?;

        // Wait for in-flight invocations.
        let permits = u32::try_from(self.config.max_concurrent).unwrap_or(u32::MAX);
        let _all = self.semaphore.acquire_many(permits).await?;

        tracing::info!(worker_id = %self.config.worker_id, "Worker stopped");
        Ok(())
    }

    /// Receive loop.
    async fn process_messages(&self) -> Result<()> {
        loop {
            // Wait for available slot
            let permit = self.semaphore.clone().acquire_owned().await?;

            let message = match self
                .queue
                .get_message(&self.topic, self.config.receive_timeout)
                .await
            {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(topic = %self.topic, error = %e, "Receive failed");
                    drop(permit);
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    continue;
                }
            };

            if message.is_control() {
                drop(permit);
                if self.handle_control(&message) {
                    return Ok(());
                }
                continue;
            }

            tracing::debug!(topic = %self.topic, key = %message.key, "Received invocation");

            let pipeline = self.pipeline.clone();
            tokio::spawn(async move {
                // Keep permit until done
                let _permit = permit;

                match pipeline.handle_message(&message).await {
                    Ok(report) => match &report.error_type {
                        Some(error_type) => tracing::error!(
                            execution_id = %report.execution_id,
                            function_execution_id = %report.function_execution_id,
                            error_type = %error_type,
                            "Invocation failed"
                        ),
                        None => tracing::debug!(
                            execution_id = %report.execution_id,
                            function_execution_id = %report.function_execution_id,
                            deliveries = report.publish.deliveries.len(),
                            abstained = report.publish.abstained,
                            "Invocation finished"
                        ),
                    },
                    Err(e) => {
                        tracing::error!(key = %message.key, error = %e, "Invocation dropped");
                    }
                }
            });
        }
    }

    /// Apply a control message. Returns true when the worker should stop.
    fn handle_control(&self, message: &KeyedMessage) -> bool {
        match serde_json::from_str::<ControlMessage>(&message.value) {
            Ok(ControlMessage::Stop) => {
                tracing::info!(topic = %self.topic, "Stop requested");
                true
            }
            Ok(ControlMessage::UpdateLocalFunctions { local_functions }) => {
                let topics: HashSet<String> = local_functions.into_iter().collect();
                self.pipeline.publisher().set_local_topics(Some(topics));
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, value = %message.value, "Ignoring malformed control message");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use workflow_engine::queue::CONTROL_MESSAGE_KEY;
    use workflow_engine::{
        create_default_registry, Envelope, ForwardedMessage, MemoryDataLayer, MemoryQueue, Metadata,
    };

    fn params(definition: serde_json::Value) -> FunctionParams {
        FunctionParams::from_json(
            &json!({
                "sandbox_id": "sb",
                "workflow_id": "wf",
                "user_id": "tester",
                "state_name": "Hello",
                "state_definition": definition,
            })
            .to_string(),
        )
        .unwrap()
    }

    fn worker(queue: Arc<MemoryQueue>, definition: serde_json::Value) -> Worker {
        let config = WorkerConfig {
            receive_timeout: Duration::from_millis(20),
            max_concurrent: 2,
            ..WorkerConfig::default()
        };
        let pipeline = ExecutionPipeline::new(
            params(definition),
            EngineConfig::default(),
            create_default_registry(),
            queue.clone(),
            Arc::new(MemoryDataLayer::new()),
        )
        .unwrap();
        Worker::new(config, pipeline, queue)
    }

    fn invocation(input: serde_json::Value) -> KeyedMessage {
        let envelope = Envelope::new(input.to_string(), Metadata::new("exec-1"));
        KeyedMessage::new("exec-1", envelope.encapsulate().unwrap())
    }

    fn control(value: serde_json::Value) -> KeyedMessage {
        KeyedMessage::new(CONTROL_MESSAGE_KEY, value.to_string())
    }

    #[test]
    fn test_control_message_parsing() {
        let stop: ControlMessage = serde_json::from_str(r#"{"action":"stop"}"#).unwrap();
        assert_eq!(stop, ControlMessage::Stop);

        let update: ControlMessage = serde_json::from_str(
            r#"{"action":"update-local-functions","localFunctions":["sb-wf-A"]}"#,
        )
        .unwrap();
        assert_eq!(
            update,
            ControlMessage::UpdateLocalFunctions {
                local_functions: vec!["sb-wf-A".to_string()]
            }
        );

        assert!(serde_json::from_str::<ControlMessage>(r#"{"action":"reboot"}"#).is_err());
    }

    #[tokio::test]
    async fn test_worker_runs_invocations_until_stopped() {
        let queue = Arc::new(MemoryQueue::new());
        let worker = worker(queue.clone(), json!({"Type": "Pass", "End": true}));
        let topic = worker.topic().to_string();

        queue.add_message(&topic, invocation(json!({"n": 1})), true).await.unwrap();
        queue.add_message(&topic, control(json!({"action": "bogus"})), true).await.unwrap();
        queue.add_message(&topic, control(json!({"action": "stop"})), true).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), worker.run())
            .await
            .expect("worker did not stop")
            .unwrap();

        let exits = queue.drain("sb-wf-exit").await;
        assert_eq!(exits.len(), 1);
        let envelope = Envelope::decapsulate(&exits[0].value).unwrap();
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&envelope.user_data).unwrap(),
            json!({"n": 1})
        );
    }

    #[tokio::test]
    async fn test_update_local_functions_reroutes_triggers() {
        let queue = Arc::new(MemoryQueue::new());
        let worker = worker(queue.clone(), json!({"Type": "Pass", "Next": "World"}));
        let topic = worker.topic().to_string();

        queue
            .add_message(
                &topic,
                control(json!({"action": "update-local-functions", "localFunctions": ["sb-wf-Hello"]})),
                true,
            )
            .await
            .unwrap();
        queue.add_message(&topic, invocation(json!({})), true).await.unwrap();
        queue.add_message(&topic, control(json!({"action": "stop"})), true).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), worker.run())
            .await
            .expect("worker did not stop")
            .unwrap();

        assert_eq!(queue.len("sb-wf-World").await, 0);
        let forwarded = queue.drain("pub_global").await;
        assert_eq!(forwarded.len(), 1);
        let message: ForwardedMessage = serde_json::from_str(&forwarded[0].value).unwrap();
        assert_eq!(message.topic_next, "sb-wf-World");
    }
}
