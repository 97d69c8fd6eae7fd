//! Trigger publisher.
//!
//! Turns an invocation's triggers into queue messages. On the way it derives
//! function-execution-ids, routes each message to the local queue or the
//! global forwarding channel, writes checkpoint records and honours the
//! workflow-wide stop flag.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};

use crate::config::FunctionParams;
use crate::definition::END_STATE;
use crate::error::{EngineError, EngineResult};
use crate::invocation::{InvocationContext, PendingWrite};
use crate::metadata::{Envelope, ForwardedMessage, Metadata};
use crate::queue::{KeyedMessage, MessageQueue};
use crate::storage::DataLayer;
use crate::trigger::Trigger;

/// Value of the stop flag once a workflow run has failed.
const STOP_FLAG_SET: &str = "1";

pub fn stop_flag_key(execution_id: &str) -> String {
    format!("workflow_execution_stop_{}", execution_id)
}

pub fn execution_info_map(execution_id: &str) -> String {
    format!("execution_info_map_{}", execution_id)
}

pub fn final_result_key(execution_id: &str) -> String {
    format!("result_{}", execution_id)
}

/// Message kinds sent on the recovery-manager channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryMessageType {
    Start,
    Running,
    Finish,
}

/// Progress report for the recovery manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryMessage {
    pub message_type: RecoveryMessageType,
    pub current_topic: String,
    pub current_function_execution_id: String,
    pub has_error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
}

/// One message handed to the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub function_execution_id: String,
}

/// What a publish pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub deliveries: Vec<Delivery>,
    /// Triggers were dropped because the run had been stopped.
    pub abstained: bool,
}

/// Publishes triggers for the hosted state.
pub struct TriggerPublisher {
    params: Arc<FunctionParams>,
    queue: Arc<dyn MessageQueue>,
    storage: Arc<dyn DataLayer>,
    state_topic: String,
    exit_topic: String,
    potential_next: HashSet<String>,
    function_list: HashSet<String>,
    local_topics: RwLock<Option<HashSet<String>>>,
}

impl TriggerPublisher {
    pub fn new(
        params: Arc<FunctionParams>,
        queue: Arc<dyn MessageQueue>,
        storage: Arc<dyn DataLayer>,
    ) -> Self {
        Self {
            state_topic: params.state_topic(),
            exit_topic: params.exit_topic(),
            potential_next: params.potential_next.iter().cloned().collect(),
            function_list: params.function_list.iter().cloned().collect(),
            local_topics: RwLock::new(params.local_topic_set()),
            params,
            queue,
            storage,
        }
    }

    pub fn state_topic(&self) -> &str {
        &self.state_topic
    }

    pub fn exit_topic(&self) -> &str {
        &self.exit_topic
    }

    /// Replace the set of topics hosted locally; `None` treats every topic as local.
    pub fn set_local_topics(&self, topics: Option<HashSet<String>>) {
        tracing::info!(count = ?topics.as_ref().map(HashSet::len), "Updating local topics");
        *self.local_topics.write().unwrap_or_else(PoisonError::into_inner) = topics;
    }

    fn is_local(&self, topic: &str) -> bool {
        self.local_topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(true, |topics| topics.contains(topic))
    }

    /// Whether this state may emit privileged triggers.
    pub fn allows_privileged(&self) -> bool {
        self.params.is_management()
    }

    fn topic_for(&self, trigger: &Trigger) -> String {
        if trigger.privileged {
            trigger.next.clone()
        } else if let Some(address) = &trigger.instance_address {
            address.clone()
        } else if trigger.next == END_STATE {
            self.exit_topic.clone()
        } else {
            self.params.topic_for(&trigger.next)
        }
    }

    /// Check a trigger against the deployment's routing rules.
    ///
    /// An empty potential-next or function list leaves that check open.
    fn validate(&self, trigger: &Trigger) -> EngineResult<()> {
        if trigger.privileged {
            return if self.allows_privileged() {
                Ok(())
            } else {
                Err(EngineError::InvalidTrigger(format!(
                    "privileged trigger to '{}' from non-management state",
                    trigger.next
                )))
            };
        }
        if trigger.is_exit() || trigger.state_action.is_some() || trigger.instance_address.is_some()
        {
            return Ok(());
        }

        let (allowed, kind) = if trigger.immediate {
            (&self.function_list, "workflow function")
        } else {
            (&self.potential_next, "potential next state")
        };
        if allowed.is_empty() || allowed.contains(&trigger.next) {
            Ok(())
        } else {
            Err(EngineError::InvalidTrigger(format!(
                "'{}' is not a {} of '{}'",
                trigger.next, kind, self.params.state_name
            )))
        }
    }

    async fn stop_requested(&self, execution_id: &str) -> EngineResult<bool> {
        let flag = self
            .storage
            .get(&self.params.backup_scope(), &stop_flag_key(execution_id))
            .await?;
        Ok(flag.as_deref() == Some(STOP_FLAG_SET))
    }

    /// End-of-invocation publish.
    ///
    /// `output` is the encoded state output. When `error` is set, the run is
    /// stopped and only the Exit topic is notified.
    pub async fn publish(
        &self,
        ctx: &InvocationContext,
        output: &str,
        triggers: Vec<Trigger>,
        error: Option<&EngineError>,
    ) -> EngineResult<PublishReport> {
        match error {
            Some(error) => self.publish_error(ctx, error).await,
            None => self.publish_success(ctx, output, triggers).await,
        }
    }

    async fn publish_error(
        &self,
        ctx: &InvocationContext,
        error: &EngineError,
    ) -> EngineResult<PublishReport> {
        let execution_id = ctx.execution_id();

        tracing::error!(
            execution_id = %execution_id,
            state = %self.params.state_name,
            error_type = %error.error_type(),
            error = %error,
            "Invocation failed, stopping workflow run"
        );

        self.record(&stop_flag_key(&execution_id), STOP_FLAG_SET).await;

        let payload = json!({ "has_error": true, "error_type": error.error_type() });
        self.checkpoint(
            &execution_id,
            &format!("result_{}_{}", ctx.function_execution_id(), self.state_topic),
            &payload.to_string(),
        )
        .await;

        let delivery = self.deliver(ctx, Trigger::new(END_STATE, payload)).await?;
        Ok(PublishReport {
            deliveries: vec![delivery],
            abstained: false,
        })
    }

    async fn publish_success(
        &self,
        ctx: &InvocationContext,
        output: &str,
        triggers: Vec<Trigger>,
    ) -> EngineResult<PublishReport> {
        let execution_id = ctx.execution_id();
        let function_execution_id = ctx.function_execution_id();

        if self.params.checkpoint {
            self.checkpoint(
                &execution_id,
                &format!("result_{}_{}", function_execution_id, self.state_topic),
                output,
            )
            .await;
        }

        self.flush_pending_writes(ctx).await?;

        if triggers.is_empty() {
            tracing::debug!(execution_id = %execution_id, "No outgoing triggers");
            return Ok(PublishReport::default());
        }

        let only_exit = triggers.iter().all(Trigger::is_exit);
        if !only_exit && self.stop_requested(&execution_id).await? {
            tracing::warn!(
                execution_id = %execution_id,
                state = %self.params.state_name,
                dropped = triggers.len(),
                "Workflow run stopped, not publishing"
            );
            return Ok(PublishReport {
                deliveries: Vec::new(),
                abstained: true,
            });
        }

        for trigger in &triggers {
            self.validate(trigger)?;
        }

        let mut report = PublishReport::default();
        for trigger in triggers {
            report.deliveries.push(self.deliver(ctx, trigger).await?);
        }

        if self.params.checkpoint {
            let ids: Vec<&str> = report
                .deliveries
                .iter()
                .map(|d| d.function_execution_id.as_str())
                .collect();
            self.checkpoint(
                &execution_id,
                &format!("next_{}", function_execution_id),
                &serde_json::to_string(&ids)?,
            )
            .await;
        }

        Ok(report)
    }

    async fn flush_pending_writes(&self, ctx: &InvocationContext) -> EngineResult<()> {
        let scope = self.params.workflow_scope();
        for write in ctx.take_pending_writes() {
            match write {
                PendingWrite::Put { key, value } => self.storage.put(&scope, &key, &value).await?,
                PendingWrite::Delete { key } => self.storage.delete(&scope, &key).await?,
            }
        }
        Ok(())
    }

    /// Publish one trigger right away, during the invocation.
    pub async fn send_now(&self, ctx: &InvocationContext, trigger: Trigger) -> EngineResult<String> {
        let trigger = Trigger {
            immediate: true,
            ..trigger
        };
        self.validate(&trigger)?;
        let delivery = self.deliver(ctx, trigger).await?;
        Ok(delivery.function_execution_id)
    }

    async fn deliver(&self, ctx: &InvocationContext, trigger: Trigger) -> EngineResult<Delivery> {
        let topic = self.topic_for(&trigger);
        let execution_id = ctx.execution_id();
        let user_data = serde_json::to_string(&trigger.value)?;

        if trigger.privileged {
            let metadata = Metadata {
                result_topic: Some(self.exit_topic.clone()),
                async_execution: true,
                ..Metadata::new(execution_id.clone())
            };
            let value = Envelope::new(user_data, metadata).encapsulate()?;
            self.forward(&topic, &execution_id, value).await?;
            tracing::debug!(execution_id = %execution_id, topic = %topic, "Published privileged trigger");
            return Ok(Delivery {
                topic,
                function_execution_id: execution_id,
            });
        }

        let function_execution_id = ctx.next_instance_id(&topic, trigger.map_branch);
        let mut metadata = ctx.metadata();
        metadata.function_execution_id = function_execution_id.clone();
        metadata.state_action = trigger.state_action;
        let value = Envelope::new(user_data.as_str(), metadata).encapsulate()?;

        let is_exit = topic == self.exit_topic;
        if is_exit || self.is_local(&topic) {
            self.queue
                .add_message(&topic, KeyedMessage::new(execution_id.clone(), value.clone()), true)
                .await?;
        } else {
            self.forward(&topic, &execution_id, value.clone()).await?;
        }

        if is_exit {
            self.record(&final_result_key(&execution_id), &user_data).await;
        } else if self.params.checkpoint {
            self.checkpoint(
                &execution_id,
                &format!("input_{}_{}", function_execution_id, topic),
                &value,
            )
            .await;
        }

        tracing::debug!(
            execution_id = %execution_id,
            function_execution_id = %function_execution_id,
            topic = %topic,
            "Published trigger"
        );
        Ok(Delivery {
            topic,
            function_execution_id,
        })
    }

    /// Write a key in the sandbox backup keyspace; failures are only logged.
    async fn record(&self, key: &str, value: &str) {
        if let Err(e) = self.storage.put(&self.params.backup_scope(), key, value).await {
            tracing::warn!(key = %key, error = %e, "Failed to write backup record");
        }
    }

    /// Add an entry to the run's checkpoint map; failures are only logged.
    async fn checkpoint(&self, execution_id: &str, entry: &str, value: &str) {
        let result = self
            .storage
            .put_map_entry(
                &self.params.backup_scope(),
                &execution_info_map(execution_id),
                entry,
                value,
            )
            .await;
        if let Err(e) = result {
            tracing::warn!(
                execution_id = %execution_id,
                entry = %entry,
                error = %e,
                "Failed to write checkpoint"
            );
        }
    }

    async fn forward(&self, topic: &str, key: &str, value: String) -> EngineResult<()> {
        let forwarded = ForwardedMessage {
            topic_next: topic.to_string(),
            value,
        };
        self.queue
            .add_message(
                &self.params.global_topic,
                KeyedMessage::new(key, serde_json::to_string(&forwarded)?),
                true,
            )
            .await?;
        Ok(())
    }

    /// Report progress to the recovery manager, when one is configured.
    pub async fn notify_recovery(
        &self,
        ctx: &InvocationContext,
        message_type: RecoveryMessageType,
        error: Option<&EngineError>,
    ) -> EngineResult<()> {
        let Some(topic) = &self.params.recovery_manager_topic else {
            return Ok(());
        };
        let message = RecoveryMessage {
            message_type,
            current_topic: self.state_topic.clone(),
            current_function_execution_id: ctx.function_execution_id(),
            has_error: error.is_some(),
            error_type: error.map(|e| e.error_type().to_string()),
        };
        self.queue
            .add_message(
                topic,
                KeyedMessage::new(ctx.execution_id(), serde_json::to_string(&message)?),
                false,
            )
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for TriggerPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerPublisher")
            .field("state_topic", &self.state_topic)
            .field("exit_topic", &self.exit_topic)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use crate::metadata::StateAction;
    use crate::queue::MemoryQueue;
    use crate::storage::MemoryDataLayer;

    struct Fixture {
        queue: Arc<MemoryQueue>,
        storage: Arc<MemoryDataLayer>,
        params: Arc<FunctionParams>,
        publisher: TriggerPublisher,
    }

    fn fixture(extra: Value) -> Fixture {
        let mut raw = json!({
            "sandbox_id": "sb",
            "workflow_id": "wf",
            "user_id": "u",
            "state_name": "Hello",
            "state_definition": {"Type": "Pass", "Next": "World"},
            "potential_next": ["World"],
            "function_list": ["Hello", "World", "Audit"],
        });
        if let (Some(raw), Value::Object(extra)) = (raw.as_object_mut(), extra) {
            raw.extend(extra);
        }
        let params = Arc::new(FunctionParams::from_json(&raw.to_string()).unwrap());
        let queue = Arc::new(MemoryQueue::new());
        let storage = Arc::new(MemoryDataLayer::new());
        let publisher = TriggerPublisher::new(params.clone(), queue.clone(), storage.clone());
        Fixture {
            queue,
            storage,
            params,
            publisher,
        }
    }

    fn ctx() -> InvocationContext {
        InvocationContext::new(Metadata::new("exec"))
    }

    #[tokio::test]
    async fn test_publish_routes_locally_and_checkpoints() {
        let fx = fixture(json!({}));
        let ctx = ctx();

        let report = fx
            .publisher
            .publish(&ctx, "{\"x\":1}", vec![Trigger::new("World", json!({"x": 1}))], None)
            .await
            .unwrap();

        assert_eq!(
            report.deliveries,
            vec![Delivery {
                topic: "sb-wf-World".into(),
                function_execution_id: "exec_1".into()
            }]
        );
        let message = fx.queue.drain("sb-wf-World").await.remove(0);
        assert_eq!(message.key, "exec");
        let envelope = Envelope::decapsulate(&message.value).unwrap();
        assert_eq!(envelope.user_data, "{\"x\":1}");
        assert_eq!(envelope.metadata.function_execution_id, "exec_1");

        let backup = fx.params.backup_scope();
        let map = fx.storage.retrieve_map(&backup, "execution_info_map_exec").await.unwrap();
        assert_eq!(map.get("result_exec_sb-wf-Hello").unwrap(), "{\"x\":1}");
        assert_eq!(map.get("next_exec").unwrap(), "[\"exec_1\"]");
        assert!(map.contains_key("input_exec_1_sb-wf-World"));
    }

    #[tokio::test]
    async fn test_publish_forwards_remote_topics() {
        let fx = fixture(json!({"local_topics": ["sb-wf-Hello"]}));

        fx.publisher
            .publish(&ctx(), "{}", vec![Trigger::new("World", json!({}))], None)
            .await
            .unwrap();

        assert_eq!(fx.queue.len("sb-wf-World").await, 0);
        let message = fx.queue.drain("pub_global").await.remove(0);
        let forwarded: ForwardedMessage = serde_json::from_str(&message.value).unwrap();
        assert_eq!(forwarded.topic_next, "sb-wf-World");

        fx.publisher.set_local_topics(None);
        fx.publisher
            .publish(&ctx(), "{}", vec![Trigger::new("World", json!({}))], None)
            .await
            .unwrap();
        assert_eq!(fx.queue.len("sb-wf-World").await, 1);
    }

    #[tokio::test]
    async fn test_publish_error_stops_run() {
        let fx = fixture(json!({}));
        let ctx = ctx();
        let error = EngineError::user_code("ValueError", "boom");

        let report = fx.publisher.publish(&ctx, "", vec![], Some(&error)).await.unwrap();
        assert_eq!(report.deliveries[0].topic, "sb-wf-exit");

        let backup = fx.params.backup_scope();
        assert_eq!(
            fx.storage.get(&backup, "workflow_execution_stop_exec").await.unwrap().as_deref(),
            Some("1")
        );
        let result: Value =
            serde_json::from_str(&fx.storage.get(&backup, "result_exec").await.unwrap().unwrap()).unwrap();
        assert_eq!(result, json!({"has_error": true, "error_type": "ValueError"}));

        // A sibling publishing later abstains, but may still reach Exit.
        let report = fx
            .publisher
            .publish(&ctx, "{}", vec![Trigger::new("World", json!({}))], None)
            .await
            .unwrap();
        assert!(report.abstained);
        assert_eq!(fx.queue.len("sb-wf-World").await, 0);

        let report = fx
            .publisher
            .publish(&ctx, "{}", vec![Trigger::new(END_STATE, json!({}))], None)
            .await
            .unwrap();
        assert!(!report.abstained);
    }

    #[tokio::test]
    async fn test_publish_rejects_unknown_next() {
        let fx = fixture(json!({}));
        let err = fx
            .publisher
            .publish(&ctx(), "{}", vec![Trigger::new("Elsewhere", json!({}))], None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTrigger(_)));

        let continuation =
            Trigger::continuation("Fork", StateAction::PostParallelProcessing, json!({}));
        assert!(fx.publisher.validate(&continuation).is_ok());
    }

    #[tokio::test]
    async fn test_send_now_uses_function_list() {
        let fx = fixture(json!({}));
        let ctx = ctx();

        let id = fx.publisher.send_now(&ctx, Trigger::new("Audit", json!(1))).await.unwrap();
        assert_eq!(id, "exec_1");
        assert!(fx.publisher.send_now(&ctx, Trigger::new("Nope", json!(1))).await.is_err());
    }

    #[tokio::test]
    async fn test_pending_writes_flushed_on_success() {
        let fx = fixture(json!({}));
        let ctx = ctx();
        ctx.queue_put("k", "v");

        fx.publisher.publish(&ctx, "{}", vec![], None).await.unwrap();
        assert_eq!(
            fx.storage.get(&fx.params.workflow_scope(), "k").await.unwrap().as_deref(),
            Some("v")
        );
    }

    #[tokio::test]
    async fn test_privileged_requires_management() {
        let fx = fixture(json!({}));
        let err = fx
            .publisher
            .publish(&ctx(), "{}", vec![Trigger::privileged("raw", json!({}))], None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTrigger(_)));

        let fx = fixture(json!({"sandbox_id": "Management"}));
        fx.publisher
            .publish(&ctx(), "{}", vec![Trigger::privileged("raw", json!({}))], None)
            .await
            .unwrap();
        let message = fx.queue.drain("pub_global").await.remove(0);
        let forwarded: ForwardedMessage = serde_json::from_str(&message.value).unwrap();
        let envelope = Envelope::decapsulate(&forwarded.value).unwrap();
        assert!(envelope.metadata.async_execution);
        assert_eq!(envelope.metadata.function_execution_id, "exec");
    }

    #[tokio::test]
    async fn test_recovery_channel() {
        let fx = fixture(json!({"recovery_manager_topic": "recovery"}));
        let error = EngineError::Coordination("x".into());
        fx.publisher
            .notify_recovery(&ctx(), RecoveryMessageType::Finish, Some(&error))
            .await
            .unwrap();

        let message = fx.queue.drain("recovery").await.remove(0);
        let value: Value = serde_json::from_str(&message.value).unwrap();
        assert_eq!(value["messageType"], "finish");
        assert_eq!(value["hasError"], true);
        assert_eq!(value["errorType"], "CoordinationError");
        assert_eq!(value["currentTopic"], "sb-wf-Hello");
    }
}
