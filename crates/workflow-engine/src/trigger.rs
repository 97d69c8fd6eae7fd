//! Triggers: "invoke this state next with this input".

use serde_json::Value;

use crate::definition::END_STATE;
use crate::metadata::StateAction;

/// A pending hand-off to another state.
#[derive(Debug, Clone, PartialEq)]
pub struct Trigger {
    /// Destination state name, [`END_STATE`], or a raw topic when privileged.
    pub next: String,

    /// Input for the destination.
    pub value: Value,

    /// Bypasses routing rules (async continuation, management channels).
    pub privileged: bool,

    /// Topic of an already-running instance to deliver to directly.
    pub instance_address: Option<String>,

    /// Sent during the invocation rather than at publish time.
    pub immediate: bool,

    /// Dispatches a Map iteration; marks the derived id.
    pub map_branch: bool,

    /// Set on fan-in continuations.
    pub state_action: Option<StateAction>,
}

impl Trigger {
    /// A plain trigger to a state.
    pub fn new(next: impl Into<String>, value: Value) -> Self {
        Self {
            next: next.into(),
            value,
            privileged: false,
            instance_address: None,
            immediate: false,
            map_branch: false,
            state_action: None,
        }
    }

    /// A trigger to a raw topic that skips normal routing.
    pub fn privileged(topic: impl Into<String>, value: Value) -> Self {
        Self {
            privileged: true,
            ..Self::new(topic, value)
        }
    }

    /// One Map iteration.
    pub fn map_branch(next: impl Into<String>, value: Value) -> Self {
        Self {
            map_branch: true,
            ..Self::new(next, value)
        }
    }

    /// Fan-in continuation back to a Parallel or Map state.
    pub fn continuation(parent: impl Into<String>, action: StateAction, value: Value) -> Self {
        Self {
            state_action: Some(action),
            ..Self::new(parent, value)
        }
    }

    /// Whether this trigger ends the workflow run.
    pub fn is_exit(&self) -> bool {
        !self.privileged && self.instance_address.is_none() && self.next == END_STATE
    }
}
