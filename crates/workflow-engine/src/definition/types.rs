//! State definition types.
//!
//! One `StateDefinition` describes the single workflow state a function
//! worker hosts. Field names follow the Amazon States Language casing.

use serde::Deserialize;
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;

use crate::choice::ChoiceBranch;
use crate::error::EngineError;
use crate::path::{deserialize_path_setting, JsonPath, PathSetting};

/// Reserved state name that routes to the workflow Exit topic.
pub const END_STATE: &str = "end";

/// Error name matching every error.
pub const STATES_ALL: &str = "States.ALL";

/// Error name matching any task failure.
pub const STATES_TASK_FAILED: &str = "States.TaskFailed";

/// State type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateType {
    Task,
    Choice,
    Pass,
    Succeed,
    Fail,
    Wait,
    Parallel,
    Map,
}

impl StateType {
    /// All known type names.
    pub const NAMES: [&'static str; 8] = [
        "Task", "Choice", "Pass", "Succeed", "Fail", "Wait", "Parallel", "Map",
    ];
}

impl fmt::Display for StateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StateType::Task => "Task",
            StateType::Choice => "Choice",
            StateType::Pass => "Pass",
            StateType::Succeed => "Succeed",
            StateType::Fail => "Fail",
            StateType::Wait => "Wait",
            StateType::Parallel => "Parallel",
            StateType::Map => "Map",
        };
        write!(f, "{}", s)
    }
}

/// A workflow state definition.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StateDefinition {
    /// State name (the key in the workflow's `States` map).
    #[serde(skip)]
    pub name: String,

    /// Type-specific part.
    #[serde(flatten)]
    pub kind: StateKind,

    #[serde(default, deserialize_with = "deserialize_path_setting")]
    pub input_path: PathSetting,

    #[serde(default, deserialize_with = "deserialize_path_setting")]
    pub output_path: PathSetting,

    #[serde(default, deserialize_with = "deserialize_path_setting")]
    pub result_path: PathSetting,

    /// Parameters template.
    #[serde(default)]
    pub parameters: Option<Value>,

    /// Static successor.
    #[serde(default)]
    pub next: Option<String>,

    /// Terminal flag.
    #[serde(default)]
    pub end: bool,

    #[serde(default)]
    pub comment: Option<String>,

    /// Set when the state lives inside a Parallel branch.
    #[serde(default)]
    pub parent_parallel_info: Option<ParentParallelInfo>,

    /// Set when the state lives inside a Map iterator.
    #[serde(default)]
    pub parent_map_info: Option<ParentMapInfo>,
}

impl StateDefinition {
    /// Type tag of this state.
    pub fn state_type(&self) -> StateType {
        match &self.kind {
            StateKind::Task(_) => StateType::Task,
            StateKind::Choice(_) => StateType::Choice,
            StateKind::Pass(_) => StateType::Pass,
            StateKind::Succeed => StateType::Succeed,
            StateKind::Fail(_) => StateType::Fail,
            StateKind::Wait(_) => StateType::Wait,
            StateKind::Parallel(_) => StateType::Parallel,
            StateKind::Map(_) => StateType::Map,
        }
    }

    /// Succeed and Fail are terminal regardless of `End`.
    pub fn is_terminal(&self) -> bool {
        self.end || matches!(self.kind, StateKind::Succeed | StateKind::Fail(_))
    }

    /// Whether the state belongs to a Parallel branch or Map iteration.
    pub fn in_branch(&self) -> bool {
        self.parent_parallel_info.is_some() || self.parent_map_info.is_some()
    }

    /// Successor taken when evaluation does not pick one itself.
    ///
    /// Terminal states resolve to [`END_STATE`]; Choice has no static edge.
    pub fn static_next(&self) -> Option<&str> {
        match self.kind {
            StateKind::Choice(_) => None,
            _ if self.is_terminal() => Some(END_STATE),
            _ => self.next.as_deref(),
        }
    }
}

/// Type-specific state fields.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "Type")]
pub enum StateKind {
    Task(TaskState),
    Choice(ChoiceState),
    Pass(PassState),
    Succeed,
    Fail(FailState),
    Wait(WaitState),
    Parallel(ParallelState),
    Map(MapState),
}

/// Task state.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskState {
    /// Task function resource name.
    pub resource: String,

    #[serde(default)]
    pub retry: Vec<Retrier>,

    #[serde(default)]
    pub catch: Vec<Catcher>,
}

/// Retry rule.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Retrier {
    pub error_equals: Vec<String>,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: f64,

    #[serde(default = "default_backoff_rate")]
    pub backoff_rate: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_interval_seconds() -> f64 {
    1.0
}

fn default_backoff_rate() -> f64 {
    2.0
}

impl Retrier {
    /// Whether this rule covers the error.
    pub fn matches(&self, error: &EngineError) -> bool {
        error_matches(&self.error_equals, error)
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let seconds = self.interval_seconds * self.backoff_rate.powi(exponent);
        if seconds.is_finite() && seconds > 0.0 {
            Duration::from_secs_f64(seconds)
        } else {
            Duration::ZERO
        }
    }
}

/// Catch rule.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Catcher {
    pub error_equals: Vec<String>,

    /// State that receives the error.
    pub next: String,

    #[serde(default, deserialize_with = "deserialize_path_setting")]
    pub result_path: PathSetting,
}

impl Catcher {
    /// Whether this rule covers the error.
    pub fn matches(&self, error: &EngineError) -> bool {
        error_matches(&self.error_equals, error)
    }
}

/// Match an error against an ErrorEquals list by class name, message or wildcard.
pub fn error_matches(error_equals: &[String], error: &EngineError) -> bool {
    let error_type = error.error_type();
    let message = error.message();
    error_equals.iter().any(|name| {
        name == STATES_ALL
            || (name == STATES_TASK_FAILED && error.is_user_code())
            || name == error_type
            || *name == message
    })
}

/// Choice state.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChoiceState {
    pub choices: Vec<ChoiceBranch>,

    #[serde(default)]
    pub default: Option<String>,
}

/// Pass state.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PassState {
    /// Static result replacing the output.
    #[serde(default)]
    pub result: Option<Value>,
}

/// Fail state.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FailState {
    #[serde(default)]
    pub error: Option<String>,

    #[serde(default)]
    pub cause: Option<String>,
}

/// Wait state. Exactly one of the fields is set.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WaitState {
    #[serde(default)]
    pub seconds: Option<f64>,

    #[serde(default)]
    pub seconds_path: Option<JsonPath>,

    /// RFC 3339 timestamp.
    #[serde(default)]
    pub timestamp: Option<String>,

    #[serde(default)]
    pub timestamp_path: Option<JsonPath>,
}

/// Parallel state.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ParallelState {
    pub branches: Vec<BranchDefinition>,
}

/// Map state.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MapState {
    pub iterator: BranchDefinition,

    #[serde(default, deserialize_with = "deserialize_path_setting")]
    pub items_path: PathSetting,

    /// Maximum outstanding iterations, 0 for unbounded.
    #[serde(default)]
    pub max_concurrency: usize,
}

/// Sub-graph of a Parallel branch or Map iterator.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BranchDefinition {
    /// First state of the branch.
    pub start_at: String,

    /// Branch states; compiled and deployed separately.
    #[serde(default)]
    pub states: Map<String, Value>,
}

/// Link from a branch state to its enclosing Parallel state.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ParentParallelInfo {
    pub name: String,

    /// 1-based branch index.
    pub branch_counter: usize,
}

/// Link from an iterator state to its enclosing Map state.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ParentMapInfo {
    pub name: String,
}
