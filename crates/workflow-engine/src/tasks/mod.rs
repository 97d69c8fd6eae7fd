//! Task functions and their registry.
//!
//! A Task state names a resource; the registry maps that name to a
//! [`TaskFunction`]. Built-in functions:
//! - `echo` - Return the input unchanged
//! - `shell` - Run a shell command

mod shell;

pub use self::shell::{ShellConfig, ShellTask};

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

use crate::error::{EngineError, EngineResult};
use crate::invocation::InvocationContext;
use crate::publisher::TriggerPublisher;
use crate::storage::{DataLayer, Scope};
use crate::trigger::Trigger;

/// Error raised by user code.
///
/// `error_type` is the class name Retry and Catch rules match on.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{error_type}: {message}")]
pub struct TaskError {
    pub error_type: String,
    pub message: String,
}

impl TaskError {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
        }
    }
}

impl From<TaskError> for EngineError {
    fn from(e: TaskError) -> Self {
        EngineError::user_code(e.error_type, e.message)
    }
}

impl From<EngineError> for TaskError {
    fn from(e: EngineError) -> Self {
        TaskError::new(e.error_type(), e.message())
    }
}

/// A function a Task state can invoke.
#[async_trait]
pub trait TaskFunction: Send + Sync {
    /// Resource name the function is registered under.
    fn name(&self) -> &str;

    /// Run the function against the state's effective input.
    async fn invoke(&self, input: Value, ctx: &TaskContext) -> Result<Value, TaskError>;
}

type BoxedTaskFuture = Pin<Box<dyn Future<Output = Result<Value, TaskError>> + Send>>;

/// A task function built from a closure.
pub struct FnTask {
    name: String,
    func: Box<dyn Fn(Value, TaskContext) -> BoxedTaskFuture + Send + Sync>,
}

impl FnTask {
    pub fn new<F, Fut>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Value, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            func: Box::new(move |input, ctx| Box::pin(func(input, ctx))),
        }
    }
}

#[async_trait]
impl TaskFunction for FnTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, input: Value, ctx: &TaskContext) -> Result<Value, TaskError> {
        (self.func)(input, ctx.clone()).await
    }
}

/// Returns its input.
#[derive(Debug, Default)]
pub struct EchoTask;

#[async_trait]
impl TaskFunction for EchoTask {
    fn name(&self) -> &str {
        "echo"
    }

    async fn invoke(&self, input: Value, _ctx: &TaskContext) -> Result<Value, TaskError> {
        Ok(input)
    }
}

/// Registry of task functions keyed by resource name.
pub struct TaskRegistry {
    tasks: HashMap<String, Arc<dyn TaskFunction>>,
}

impl TaskRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
        }
    }

    /// Register a task function, replacing any previous one of the same name.
    pub fn register<T: TaskFunction + 'static>(&mut self, task: T) {
        let name = task.name().to_string();
        self.tasks.insert(name, Arc::new(task));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskFunction>> {
        self.tasks.get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// List all registered resource names.
    pub fn list(&self) -> Vec<&str> {
        self.tasks.keys().map(|s| s.as_str()).collect()
    }

    /// Invoke a task function by resource name.
    pub async fn invoke(&self, name: &str, input: Value, ctx: &TaskContext) -> EngineResult<Value> {
        let task = self
            .get(name)
            .ok_or_else(|| EngineError::TaskNotFound(name.to_string()))?;
        tracing::debug!(resource = %name, "Invoking task function");
        task.invoke(input, ctx).await.map_err(EngineError::from)
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.tasks.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Create a registry with the built-in task functions.
pub fn create_default_registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry.register(EchoTask);
    registry.register(ShellTask::new());
    registry
}

/// API available to a task function during one invocation.
#[derive(Clone)]
pub struct TaskContext {
    invocation: InvocationContext,
    publisher: Arc<TriggerPublisher>,
    storage: Arc<dyn DataLayer>,
    scope: Scope,
}

impl TaskContext {
    pub fn new(
        invocation: InvocationContext,
        publisher: Arc<TriggerPublisher>,
        storage: Arc<dyn DataLayer>,
        scope: Scope,
    ) -> Self {
        Self {
            invocation,
            publisher,
            storage,
            scope,
        }
    }

    pub fn invocation(&self) -> &InvocationContext {
        &self.invocation
    }

    pub fn execution_id(&self) -> String {
        self.invocation.execution_id()
    }

    /// Add a trigger to `state`, published with the state's own output.
    pub fn add_dynamic_next(&self, state: impl Into<String>, value: Value) {
        self.invocation.add_trigger(Trigger::new(state, value));
    }

    /// Publish to `state` right away instead of at the end of the invocation.
    ///
    /// Returns the function-execution-id of the new instance.
    pub async fn send_to_function_now(
        &self,
        state: impl Into<String>,
        value: Value,
    ) -> EngineResult<String> {
        self.publisher
            .send_now(&self.invocation, Trigger::new(state, value))
            .await
    }

    /// Add a trigger to a raw topic. Only management functions may do this.
    pub fn add_privileged_trigger(&self, topic: impl Into<String>, value: Value) -> EngineResult<()> {
        let topic = topic.into();
        if !self.publisher.allows_privileged() {
            return Err(EngineError::InvalidTrigger(format!(
                "privileged trigger to '{}' from a non-management function",
                topic
            )));
        }
        self.invocation.add_trigger(Trigger::privileged(topic, value));
        Ok(())
    }

    /// Buffer a write to the workflow storage; applied when the invocation publishes.
    pub fn put(&self, key: impl Into<String>, value: impl Into<String>) {
        self.invocation.queue_put(key, value);
    }

    /// Buffer a delete from the workflow storage.
    pub fn delete(&self, key: impl Into<String>) {
        self.invocation.queue_delete(key);
    }

    /// Read from the workflow storage. Buffered writes are not visible.
    pub async fn get(&self, key: &str) -> EngineResult<Option<String>> {
        Ok(self.storage.get(&self.scope, key).await?)
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("invocation", &self.invocation)
            .field("scope", &self.scope)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::FunctionParams;
    use crate::metadata::Metadata;
    use crate::queue::MemoryQueue;
    use crate::storage::MemoryDataLayer;
    use serde_json::json;

    pub(crate) fn params(state: &str, definition: Value) -> FunctionParams {
        FunctionParams::from_json(
            &json!({
                "sandbox_id": "sb",
                "workflow_id": "wf",
                "user_id": "u",
                "state_name": state,
                "state_definition": definition,
            })
            .to_string(),
        )
        .unwrap()
    }

    pub(crate) struct Fixture {
        pub queue: Arc<MemoryQueue>,
        pub storage: Arc<MemoryDataLayer>,
        pub ctx: TaskContext,
    }

    pub(crate) fn fixture(params: FunctionParams) -> Fixture {
        let queue = Arc::new(MemoryQueue::new());
        let storage = Arc::new(MemoryDataLayer::new());
        let scope = params.workflow_scope();
        let publisher = Arc::new(TriggerPublisher::new(
            Arc::new(params),
            queue.clone(),
            storage.clone(),
        ));
        let ctx = TaskContext::new(
            InvocationContext::new(Metadata::new("exec")),
            publisher,
            storage.clone(),
            scope,
        );
        Fixture {
            queue,
            storage,
            ctx,
        }
    }
}
