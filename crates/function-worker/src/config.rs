//! Worker configuration.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

use workflow_engine::FunctionParams;

/// Function worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Unique worker identifier (UUID).
    pub worker_id: String,

    /// NATS server URL.
    pub nats_url: String,

    /// JetStream stream carrying every state topic.
    pub nats_stream: String,

    /// JetStream key/value bucket backing workflow storage.
    pub nats_kv_bucket: String,

    /// Path of the function params JSON file.
    pub function_params: PathBuf,

    /// Maximum concurrent invocations.
    pub max_concurrent: usize,

    /// How long one receive waits for a message.
    pub receive_timeout: Duration,

    /// Emit logs as JSON.
    pub log_json: bool,
}

impl WorkerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let worker_id = std::env::var("WORKER_ID").unwrap_or(defaults.worker_id);

        let nats_url = std::env::var("NATS_URL").unwrap_or(defaults.nats_url);

        let nats_stream = std::env::var("NATS_STREAM").unwrap_or(defaults.nats_stream);

        let nats_kv_bucket = std::env::var("NATS_KV_BUCKET").unwrap_or(defaults.nats_kv_bucket);

        let function_params = std::env::var("FUNCTION_PARAMS")
            .map(PathBuf::from)
            .unwrap_or(defaults.function_params);

        let max_concurrent: usize = std::env::var("WORKER_MAX_CONCURRENT")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|n| *n > 0)
            .unwrap_or(defaults.max_concurrent);

        let receive_timeout_ms: u64 = std::env::var("WORKER_RECEIVE_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1_000);

        let log_json = std::env::var("WORKER_LOG_JSON")
            .map(|v| parse_flag(&v))
            .unwrap_or(false);

        Ok(Self {
            worker_id,
            nats_url,
            nats_stream,
            nats_kv_bucket,
            function_params,
            max_concurrent,
            receive_timeout: Duration::from_millis(receive_timeout_ms),
            log_json,
        })
    }

    /// Read and parse the function params file.
    pub fn load_params(&self) -> Result<FunctionParams> {
        load_params(&self.function_params)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: uuid::Uuid::new_v4().to_string(),
            nats_url: "nats://localhost:4222".to_string(),
            nats_stream: "workflow_states".to_string(),
            nats_kv_bucket: "workflow_storage".to_string(),
            function_params: PathBuf::from("function_params.json"),
            max_concurrent: 4,
            receive_timeout: Duration::from_secs(1),
            log_json: false,
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Read and parse a function params file.
pub fn load_params(path: &Path) -> Result<FunctionParams> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read function params from {}", path.display()))?;
    FunctionParams::from_json(&text)
        .with_context(|| format!("Invalid function params in {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = WorkerConfig::default();
        assert!(!config.worker_id.is_empty());
        assert_eq!(config.max_concurrent, 4);
        assert_eq!(config.receive_timeout, Duration::from_secs(1));
        assert!(!config.log_json);
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("true"));
        assert!(parse_flag(" 1 "));
        assert!(parse_flag("YES"));
        assert!(!parse_flag("false"));
        assert!(!parse_flag(""));
    }

    #[test]
    fn test_load_params() {
        let path = std::env::temp_dir().join(format!("params-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            r#"{"sandbox_id":"sb","workflow_id":"wf","state_name":"Hello","state_definition":{"Type":"Pass","End":true}}"#,
        )
        .unwrap();

        let params = load_params(&path).unwrap();
        assert_eq!(params.state_topic(), "sb-wf-Hello");

        std::fs::remove_file(&path).unwrap();
        assert!(load_params(&path).is_err());
    }
}
