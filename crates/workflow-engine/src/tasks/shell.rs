//! Shell command task function.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time::timeout;

use super::{TaskContext, TaskError, TaskFunction};

/// Error type raised for a non-zero exit status.
pub const SHELL_COMMAND_FAILED: &str = "ShellCommandFailed";

/// Error type raised when the command outlives its timeout.
pub const STATES_TIMEOUT: &str = "States.Timeout";

/// Input accepted by the shell task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellConfig {
    /// Command to execute.
    pub command: String,

    /// Shell to use (default: "bash").
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Working directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,

    /// Environment variables.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Timeout in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<f64>,
}

fn default_shell() -> String {
    "bash".to_string()
}

/// Captured result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Runs a shell command and returns its captured output.
#[derive(Debug, Default)]
pub struct ShellTask;

impl ShellTask {
    pub fn new() -> Self {
        Self
    }

    /// Run a command to completion.
    pub async fn run(&self, config: &ShellConfig) -> Result<ShellOutput, TaskError> {
        let mut cmd = Command::new(&config.shell);
        cmd.arg("-c").arg(&config.command);

        if let Some(dir) = &config.cwd {
            cmd.current_dir(dir);
        }
        for (k, v) in &config.env {
            cmd.env(k, v);
        }
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            TaskError::new(SHELL_COMMAND_FAILED, format!("Failed to spawn process: {}", e))
        })?;

        // Read stdout and stderr concurrently
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_handle = tokio::spawn(read_lines(stdout));
        let stderr_handle = tokio::spawn(read_lines(stderr));

        let wait_result = match config.timeout_seconds.map(Duration::from_secs_f64) {
            Some(duration) => match timeout(duration, child.wait()).await {
                Ok(result) => result,
                Err(_) => {
                    let _ = child.kill().await;
                    return Err(TaskError::new(
                        STATES_TIMEOUT,
                        format!("command timed out after {:?}", duration),
                    ));
                }
            },
            None => child.wait().await,
        };

        let status = wait_result.map_err(|e| {
            TaskError::new(SHELL_COMMAND_FAILED, format!("Failed to wait for process: {}", e))
        })?;

        Ok(ShellOutput {
            stdout: stdout_handle.await.unwrap_or_default(),
            stderr: stderr_handle.await.unwrap_or_default(),
            exit_code: status.code().unwrap_or(-1),
        })
    }
}

async fn read_lines<R>(stream: Option<R>) -> String
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut output = String::new();
    if let Some(stream) = stream {
        let mut reader = BufReader::new(stream).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            output.push_str(&line);
            output.push('\n');
        }
    }
    output
}

#[async_trait]
impl TaskFunction for ShellTask {
    fn name(&self) -> &str {
        "shell"
    }

    async fn invoke(&self, input: Value, _ctx: &TaskContext) -> Result<Value, TaskError> {
        let config: ShellConfig = serde_json::from_value(input)
            .map_err(|e| TaskError::new("InvalidShellConfig", e.to_string()))?;

        tracing::debug!(
            command = %config.command,
            shell = %config.shell,
            cwd = ?config.cwd,
            timeout = ?config.timeout_seconds,
            "Executing shell command"
        );

        let output = self.run(&config).await?;
        if output.exit_code != 0 {
            return Err(TaskError::new(
                SHELL_COMMAND_FAILED,
                format!(
                    "exit code {}: {}",
                    output.exit_code,
                    output.stderr.trim_end()
                ),
            ));
        }

        Ok(json!({
            "stdout": output.stdout,
            "stderr": output.stderr,
            "exit_code": output.exit_code,
        }))
    }
}
