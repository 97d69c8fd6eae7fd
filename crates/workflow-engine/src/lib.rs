//! Workflow State Execution Engine
//!
//! Executes one state of an ASL-style state machine per invocation and
//! hands off to the next state(s) through a message queue.
//!
//! This crate provides:
//! - State definition model with path and Choice rule interpreters
//! - State evaluator, including Retry/Catch and Parallel/Map fan-out and fan-in
//! - Trigger publisher with checkpointing and workflow-wide stop
//! - Execution pipeline sequencing both for one message
//! - Storage and queue contracts with in-memory implementations
//! - Task function registry with built-in `echo` and `shell` functions

pub mod choice;
pub mod config;
pub mod definition;
pub mod error;
pub mod evaluator;
pub mod invocation;
pub mod metadata;
pub mod path;
pub mod pipeline;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod storage;
pub mod tasks;
pub mod trigger;

pub use config::{EngineConfig, FunctionParams};
pub use definition::{parse_state, StateDefinition, StateKind, StateType};
pub use error::{EngineError, EngineResult};
pub use evaluator::{Evaluation, StateEvaluator, Transition};
pub use invocation::InvocationContext;
pub use metadata::{Envelope, ForwardedMessage, Metadata, StateAction};
pub use pipeline::{ExecutionPipeline, InvocationReport};
pub use publisher::{PublishReport, TriggerPublisher};
pub use queue::{KeyedMessage, MemoryQueue, MessageQueue, QueueError};
pub use retry::{Backoff, RetryPolicy};
pub use storage::{DataLayer, Locality, MemoryDataLayer, Scope, StorageError};
pub use tasks::{create_default_registry, TaskContext, TaskError, TaskFunction, TaskRegistry};
pub use trigger::Trigger;
