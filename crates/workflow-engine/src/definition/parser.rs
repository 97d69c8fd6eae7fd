//! State definition parser.
//!
//! Validates the `Type` tag before the full parse so that an unknown type
//! surfaces as `UnknownStateType` rather than a generic decoding error.

use serde_json::Value;

use crate::definition::types::{StateDefinition, StateKind, StateType};
use crate::error::{EngineError, EngineResult};

/// Parse a JSON text state definition.
pub fn parse_state_json(name: &str, text: &str) -> EngineResult<StateDefinition> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| EngineError::InvalidDefinition(format!("state '{}': {}", name, e)))?;
    parse_state(name, &value)
}

/// Parse a state definition object.
pub fn parse_state(name: &str, value: &Value) -> EngineResult<StateDefinition> {
    let state_type = value
        .get("Type")
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::InvalidDefinition(format!("state '{}' has no Type", name)))?;

    if !StateType::NAMES.contains(&state_type) {
        return Err(EngineError::UnknownStateType(state_type.to_string()));
    }

    let mut definition: StateDefinition = serde_json::from_value(value.clone())
        .map_err(|e| EngineError::InvalidDefinition(format!("state '{}': {}", name, e)))?;
    definition.name = name.to_string();

    validate_state(&definition)?;

    Ok(definition)
}

/// Validate a parsed state definition.
pub fn validate_state(definition: &StateDefinition) -> EngineResult<()> {
    let invalid = |reason: String| {
        EngineError::InvalidDefinition(format!("state '{}': {}", definition.name, reason))
    };

    match &definition.kind {
        StateKind::Choice(choice) => {
            if choice.choices.is_empty() {
                return Err(invalid("Choice needs at least one rule".to_string()));
            }
        }
        StateKind::Succeed | StateKind::Fail(_) => {}
        _ => match (&definition.next, definition.end) {
            (Some(_), true) => return Err(invalid("Next and End are exclusive".to_string())),
            (None, false) => return Err(invalid("one of Next or End is required".to_string())),
            _ => {}
        },
    }

    match &definition.kind {
        StateKind::Task(task) => {
            for retrier in &task.retry {
                if retrier.error_equals.is_empty() {
                    return Err(invalid("Retry rule has empty ErrorEquals".to_string()));
                }
                if retrier.backoff_rate < 1.0 {
                    return Err(invalid(format!(
                        "BackoffRate must be at least 1.0, got {}",
                        retrier.backoff_rate
                    )));
                }
            }
            for catcher in &task.catch {
                if catcher.error_equals.is_empty() {
                    return Err(invalid("Catch rule has empty ErrorEquals".to_string()));
                }
            }
        }
        StateKind::Wait(wait) => {
            let set = [
                wait.seconds.is_some(),
                wait.seconds_path.is_some(),
                wait.timestamp.is_some(),
                wait.timestamp_path.is_some(),
            ]
            .iter()
            .filter(|present| **present)
            .count();
            if set != 1 {
                return Err(invalid(
                    "Wait needs exactly one of Seconds, SecondsPath, Timestamp, TimestampPath"
                        .to_string(),
                ));
            }
        }
        StateKind::Parallel(parallel) => {
            if parallel.branches.is_empty() {
                return Err(invalid("Parallel needs at least one branch".to_string()));
            }
        }
        _ => {}
    }

    if let Some(parent) = &definition.parent_parallel_info {
        if parent.branch_counter == 0 {
            return Err(invalid("ParentParallelInfo.BranchCounter is 1-based".to_string()));
        }
    }

    Ok(())
}
