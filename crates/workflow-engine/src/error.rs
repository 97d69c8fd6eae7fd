//! Engine error types.
//!
//! Every error carries a class name (`error_type`) which is what Retry and
//! Catch rules match against and what the Exit topic reports back.

use thiserror::Error;

use crate::queue::QueueError;
use crate::storage::StorageError;

/// Result alias used throughout the engine.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur while executing one invocation.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Incoming payload was not valid JSON text.
    #[error("Input decoding error: {0}")]
    InputDecoding(String),

    /// InputPath/ItemsPath/Parameters/ResultPath/OutputPath referenced missing data.
    #[error("Path processing error: {0}")]
    PathProcessing(String),

    /// A task function raised an error.
    #[error("{error_type}: {message}")]
    UserCode { error_type: String, message: String },

    /// Fan-out/fan-in bookkeeping invariant violated.
    #[error("Coordination error: {0}")]
    Coordination(String),

    /// State definition names a type the engine does not know.
    #[error("Unknown state type: {0}")]
    UnknownStateType(String),

    /// State definition is malformed.
    #[error("Invalid state definition: {0}")]
    InvalidDefinition(String),

    /// Wait state computed an unusable delay.
    #[error("Invalid wait: {0}")]
    InvalidWait(String),

    /// The invocation exceeded the configured number of state transitions.
    #[error("State transition limit exceeded: {0}")]
    TransitionLimit(u64),

    /// Task resource is not registered.
    #[error("Task function not found: {0}")]
    TaskNotFound(String),

    /// Trigger rejected before publish.
    #[error("Invalid trigger: {0}")]
    InvalidTrigger(String),

    /// Storage service failure.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Queue service failure.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// JSON encoding failure.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl EngineError {
    /// Create a user code error.
    pub fn user_code(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::UserCode {
            error_type: error_type.into(),
            message: message.into(),
        }
    }

    /// Class name of the error.
    pub fn error_type(&self) -> &str {
        match self {
            EngineError::InputDecoding(_) => "InputDecodingError",
            EngineError::PathProcessing(_) => "PathProcessingError",
            EngineError::UserCode { error_type, .. } => error_type,
            EngineError::Coordination(_) => "CoordinationError",
            EngineError::UnknownStateType(_) => "UnknownStateTypeError",
            EngineError::InvalidDefinition(_) => "InvalidDefinitionError",
            EngineError::InvalidWait(_) => "InvalidWaitError",
            EngineError::TransitionLimit(_) => "TransitionLimitError",
            EngineError::TaskNotFound(_) => "TaskNotFoundError",
            EngineError::InvalidTrigger(_) => "InvalidTriggerError",
            EngineError::Storage(_) => "StorageError",
            EngineError::Queue(_) => "QueueError",
            EngineError::Serialization(_) => "SerializationError",
        }
    }

    /// Message part of the error, without the class name.
    pub fn message(&self) -> String {
        match self {
            EngineError::UserCode { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Whether this error came out of the invoked task.
    pub fn is_user_code(&self) -> bool {
        matches!(self, EngineError::UserCode { .. })
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Serialization(e.to_string())
    }
}
