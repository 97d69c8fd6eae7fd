//! Invocation metadata and the message envelope.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::error::{EngineError, EngineResult};

/// Post-fan-in action carried by a continuation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateAction {
    /// Harvest a finished Map batch.
    PostMapProcessing,
    /// Aggregate the branches of a Parallel state.
    PostParallelProcessing,
}

impl fmt::Display for StateAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateAction::PostMapProcessing => write!(f, "post_map_processing"),
            StateAction::PostParallelProcessing => write!(f, "post_parallel_processing"),
        }
    }
}

/// Platform metadata travelling with every message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Workflow-run-scoped id.
    #[serde(rename = "__execution_id", default)]
    pub execution_id: String,

    /// Hop-scoped id, derived from the parent hop.
    #[serde(rename = "__function_execution_id", default)]
    pub function_execution_id: String,

    /// Topic the caller expects the final result on.
    #[serde(
        rename = "__result_topic",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub result_topic: Option<String>,

    /// Set when the run was started asynchronously.
    #[serde(rename = "__async_execution", default)]
    pub async_execution: bool,

    /// Number of states visited so far in this run.
    #[serde(default)]
    pub state_counter: u64,

    /// Post-fan-in action.
    #[serde(
        rename = "__state_action",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub state_action: Option<StateAction>,

    /// User-extensible metadata.
    #[serde(
        rename = "__mfnusermetadata",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub user_metadata: Option<Map<String, Value>>,

    /// Everything else, including fan-out coordination descriptors.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Metadata {
    /// Create metadata for a new workflow run.
    pub fn new(execution_id: impl Into<String>) -> Self {
        let execution_id = execution_id.into();
        Self {
            function_execution_id: execution_id.clone(),
            execution_id,
            ..Default::default()
        }
    }

    /// Fetch and decode an entry from `extra`.
    pub fn get_extra<T: serde::de::DeserializeOwned>(&self, key: &str) -> EngineResult<Option<T>> {
        self.extra
            .get(key)
            .map(|value| serde_json::from_value(value.clone()))
            .transpose()
            .map_err(EngineError::from)
    }

    /// Encode and store an entry in `extra`.
    pub fn set_extra<T: Serialize>(&mut self, key: impl Into<String>, value: &T) -> EngineResult<()> {
        self.extra.insert(key.into(), serde_json::to_value(value)?);
        Ok(())
    }
}

/// Encapsulated message: user payload as JSON text plus platform metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// User payload, JSON text.
    #[serde(rename = "__mfnuserdata")]
    pub user_data: String,

    /// Platform metadata.
    #[serde(rename = "__mfnmetadata")]
    pub metadata: Metadata,
}

impl Envelope {
    /// Wrap a payload and metadata.
    pub fn new(user_data: impl Into<String>, metadata: Metadata) -> Self {
        Self {
            user_data: user_data.into(),
            metadata,
        }
    }

    /// Encode as the JSON text carried on the queue.
    pub fn encapsulate(&self) -> EngineResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Split incoming JSON text into payload and metadata.
    pub fn decapsulate(text: &str) -> EngineResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| EngineError::InputDecoding(format!("malformed envelope: {}", e)))
    }
}

/// Message forwarded through the global channel to a remote host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardedMessage {
    /// Destination topic.
    #[serde(rename = "topicNext")]
    pub topic_next: String,

    /// Encapsulated envelope text.
    pub value: String,
}

/// Decode a user payload; an empty payload is treated as `{}`.
pub fn decode_input(text: &str) -> EngineResult<Value> {
    if text.trim().is_empty() {
        return Ok(Value::Object(Map::new()));
    }
    serde_json::from_str(text).map_err(|e| EngineError::InputDecoding(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_metadata_wire_names() {
        let mut metadata = Metadata::new("exec-1");
        metadata.state_action = Some(StateAction::PostParallelProcessing);
        metadata.state_counter = 4;
        metadata.extra.insert("Fork_exec-1_parallel_info".into(), json!({"k": 1}));

        let value = serde_json::to_value(&metadata).unwrap();
        assert_eq!(value["__execution_id"], "exec-1");
        assert_eq!(value["__function_execution_id"], "exec-1");
        assert_eq!(value["__state_action"], "post_parallel_processing");
        assert_eq!(value["state_counter"], 4);
        assert_eq!(value["Fork_exec-1_parallel_info"], json!({"k": 1}));
        assert!(value.get("__result_topic").is_none());
    }

    #[test]
    fn test_envelope_decapsulate() {
        let text = r#"{"__mfnuserdata":"{\"a\":1}","__mfnmetadata":{"__execution_id":"e","__function_execution_id":"e_1","state_counter":2,"custom":true}}"#;
        let envelope = Envelope::decapsulate(text).unwrap();
        assert_eq!(envelope.user_data, r#"{"a":1}"#);
        assert_eq!(envelope.metadata.function_execution_id, "e_1");
        assert_eq!(envelope.metadata.state_action, None);
        assert_eq!(envelope.metadata.extra.get("custom"), Some(&json!(true)));
    }

    #[test]
    fn test_envelope_malformed() {
        let err = Envelope::decapsulate("not json").unwrap_err();
        assert!(matches!(err, EngineError::InputDecoding(_)));
    }

    #[test]
    fn test_decode_input() {
        assert_eq!(decode_input("").unwrap(), json!({}));
        assert_eq!(decode_input("[1,2]").unwrap(), json!([1, 2]));
        assert!(matches!(
            decode_input("{oops").unwrap_err(),
            EngineError::InputDecoding(_)
        ));
    }

    #[test]
    fn test_forwarded_message_field_names() {
        let msg = ForwardedMessage {
            topic_next: "wf-Next".to_string(),
            value: "{}".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"topicNext\":\"wf-Next\""));
    }
}
