//! Engine configuration.

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;

use crate::definition::{parse_state, StateDefinition};
use crate::error::{EngineError, EngineResult};
use crate::storage::{
    Locality, Scope, COUNTER_TRIGGERS_INFO_TABLE, COUNTER_TRIGGERS_TABLE, DEFAULT_TABLE,
};

/// Sandbox/workflow name allowed to emit privileged triggers.
pub const MANAGEMENT: &str = "Management";

/// Engine tuning loaded from environment variables.
///
/// Environment variables are prefixed with `MFN_`:
/// - `MFN_FAN_IN_TIMEOUT_MS`: Deadline for fan-in reads (default: 30000)
/// - `MFN_FAN_IN_POLL_INITIAL_MS`: First fan-in poll interval (default: 50)
/// - `MFN_FAN_IN_POLL_MAX_MS`: Longest fan-in poll interval (default: 1000)
/// - `MFN_MAX_STATE_TRANSITIONS`: state_counter limit per run (default: 10000)
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_fan_in_timeout_ms")]
    pub fan_in_timeout_ms: u64,

    #[serde(default = "default_fan_in_poll_initial_ms")]
    pub fan_in_poll_initial_ms: u64,

    #[serde(default = "default_fan_in_poll_max_ms")]
    pub fan_in_poll_max_ms: u64,

    #[serde(default = "default_max_state_transitions")]
    pub max_state_transitions: u64,
}

fn default_fan_in_timeout_ms() -> u64 {
    30_000
}

fn default_fan_in_poll_initial_ms() -> u64 {
    50
}

fn default_fan_in_poll_max_ms() -> u64 {
    1_000
}

fn default_max_state_transitions() -> u64 {
    10_000
}

impl EngineConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("MFN_").from_env::<EngineConfig>()
    }

    pub fn fan_in_timeout(&self) -> Duration {
        Duration::from_millis(self.fan_in_timeout_ms)
    }

    pub fn fan_in_poll_initial(&self) -> Duration {
        Duration::from_millis(self.fan_in_poll_initial_ms)
    }

    pub fn fan_in_poll_max(&self) -> Duration {
        Duration::from_millis(self.fan_in_poll_max_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fan_in_timeout_ms: default_fan_in_timeout_ms(),
            fan_in_poll_initial_ms: default_fan_in_poll_initial_ms(),
            fan_in_poll_max_ms: default_fan_in_poll_max_ms(),
            max_state_transitions: default_max_state_transitions(),
        }
    }
}

/// Deployment descriptor of the single state a worker hosts.
#[derive(Debug, Clone, Deserialize)]
pub struct FunctionParams {
    /// Sandbox the workflow is deployed in.
    pub sandbox_id: String,

    /// Workflow id.
    pub workflow_id: String,

    /// Owner of the workflow's user storage.
    #[serde(default)]
    pub user_id: String,

    /// Name of the hosted state.
    pub state_name: String,

    /// ASL definition of the hosted state.
    pub state_definition: Value,

    /// Prefix turning a state name into a topic (default: `<sandbox>-<workflow>-`).
    #[serde(default)]
    pub topic_prefix: Option<String>,

    /// Workflow exit topic (default: `<prefix>exit`).
    #[serde(default)]
    pub exit_topic: Option<String>,

    /// Topic used to reach states hosted elsewhere.
    #[serde(default = "default_global_topic")]
    pub global_topic: String,

    /// States this state may trigger.
    #[serde(default)]
    pub potential_next: Vec<String>,

    /// Every state of the workflow.
    #[serde(default)]
    pub function_list: Vec<String>,

    /// Topics hosted on this host; `None` means all of them.
    #[serde(default)]
    pub local_topics: Option<Vec<String>>,

    /// Record checkpoint entries for recovery.
    #[serde(default = "default_true")]
    pub checkpoint: bool,

    /// Recovery manager topic; unset disables the channel.
    #[serde(default)]
    pub recovery_manager_topic: Option<String>,
}

fn default_global_topic() -> String {
    "pub_global".to_string()
}

fn default_true() -> bool {
    true
}

impl FunctionParams {
    /// Parse params from JSON text.
    pub fn from_json(text: &str) -> EngineResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| EngineError::InvalidDefinition(format!("function params: {}", e)))
    }

    /// Parse the hosted state's definition.
    pub fn definition(&self) -> EngineResult<StateDefinition> {
        parse_state(&self.state_name, &self.state_definition)
    }

    pub fn topic_prefix(&self) -> String {
        self.topic_prefix
            .clone()
            .unwrap_or_else(|| format!("{}-{}-", self.sandbox_id, self.workflow_id))
    }

    /// Topic of a state.
    pub fn topic_for(&self, state: &str) -> String {
        format!("{}{}", self.topic_prefix(), state)
    }

    /// Topic of the hosted state.
    pub fn state_topic(&self) -> String {
        self.topic_for(&self.state_name)
    }

    pub fn exit_topic(&self) -> String {
        self.exit_topic
            .clone()
            .unwrap_or_else(|| self.topic_for("exit"))
    }

    /// Management functions may emit privileged triggers.
    pub fn is_management(&self) -> bool {
        self.sandbox_id == MANAGEMENT || self.workflow_id == MANAGEMENT
    }

    pub fn local_topic_set(&self) -> Option<HashSet<String>> {
        self.local_topics
            .as_ref()
            .map(|topics| topics.iter().cloned().collect())
    }

    /// User storage: workflow data, branch outputs, fan-in records.
    pub fn workflow_scope(&self) -> Scope {
        Scope::new(
            format!("storage_{}", self.user_id),
            DEFAULT_TABLE,
            Locality::Global,
        )
    }

    /// Fan-in counters.
    pub fn counter_scope(&self) -> Scope {
        self.workflow_scope().with_table(COUNTER_TRIGGERS_TABLE)
    }

    /// Fan-in counter metadata.
    pub fn counter_info_scope(&self) -> Scope {
        self.workflow_scope().with_table(COUNTER_TRIGGERS_INFO_TABLE)
    }

    /// Sandbox backup storage: stop flags, checkpoints, final results.
    pub fn backup_scope(&self) -> Scope {
        Scope::new(
            format!("sbox_{}", self.sandbox_id),
            DEFAULT_TABLE,
            Locality::Global,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params() -> FunctionParams {
        FunctionParams::from_json(
            &json!({
                "sandbox_id": "sb",
                "workflow_id": "wf",
                "user_id": "alice",
                "state_name": "Hello",
                "state_definition": {"Type": "Pass", "End": true}
            })
            .to_string(),
        )
        .unwrap()
    }

    #[test]
    fn test_default_engine_config() {
        let config = EngineConfig::default();
        assert_eq!(config.fan_in_timeout(), Duration::from_secs(30));
        assert_eq!(config.max_state_transitions, 10_000);
    }

    #[test]
    fn test_params_defaults() {
        let p = params();
        assert_eq!(p.topic_prefix(), "sb-wf-");
        assert_eq!(p.state_topic(), "sb-wf-Hello");
        assert_eq!(p.exit_topic(), "sb-wf-exit");
        assert_eq!(p.global_topic, "pub_global");
        assert!(p.checkpoint);
        assert!(p.local_topic_set().is_none());
        assert!(!p.is_management());
        assert_eq!(p.workflow_scope().keyspace, "storage_alice");
        assert_eq!(p.counter_scope().table, COUNTER_TRIGGERS_TABLE);
        assert_eq!(p.backup_scope().keyspace, "sbox_sb");
        assert_eq!(p.definition().unwrap().name, "Hello");
    }

    #[test]
    fn test_params_invalid() {
        assert!(FunctionParams::from_json("{}").is_err());
    }
}
