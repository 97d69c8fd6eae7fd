//! State evaluator.
//!
//! Interprets the hosted state's definition against one effective input.
//! Path processing happens around it, in the pipeline; the evaluator only
//! produces the state's raw result, how the state transitions, and any
//! dynamic triggers (branch dispatch, Catch targets, fan-in continuations).

mod fanout;
mod task;
mod wait;

pub use self::fanout::{
    map_info_key, parallel_info_key, ContinuationInput, CoordinationInfo, CounterMetadata,
    FanOutKeys,
};
pub use self::wait::wait_duration;

use serde_json::Value;
use std::sync::Arc;

use crate::choice::select_next;
use crate::config::{EngineConfig, FunctionParams};
use crate::definition::{StateDefinition, StateKind};
use crate::error::EngineResult;
use crate::storage::DataLayer;
use crate::tasks::{TaskContext, TaskRegistry};

/// How the state hands off after evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Follow the definition's Next/End.
    Static,
    /// Follow the Choice-selected state, or stop when nothing matched.
    Choice(Option<String>),
    /// No static edge; any hand-off is already among the dynamic triggers.
    Suppressed,
}

/// Result of evaluating a state.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub output: Value,
    pub transition: Transition,
    /// Input ResultPath merges into, when it is not this invocation's input.
    pub state_input: Option<Value>,
}

impl Evaluation {
    pub fn new(output: Value) -> Self {
        Self {
            output,
            transition: Transition::Static,
            state_input: None,
        }
    }

    pub fn choice(output: Value, next: Option<String>) -> Self {
        Self {
            transition: Transition::Choice(next),
            ..Self::new(output)
        }
    }

    pub fn suppressed(output: Value) -> Self {
        Self {
            transition: Transition::Suppressed,
            ..Self::new(output)
        }
    }

    fn with_state_input(self, state_input: Value) -> Self {
        Self {
            state_input: Some(state_input),
            ..self
        }
    }
}

/// Evaluates the hosted state.
pub struct StateEvaluator {
    definition: Arc<StateDefinition>,
    params: Arc<FunctionParams>,
    config: EngineConfig,
    tasks: Arc<TaskRegistry>,
    storage: Arc<dyn DataLayer>,
}

impl StateEvaluator {
    pub fn new(
        definition: Arc<StateDefinition>,
        params: Arc<FunctionParams>,
        config: EngineConfig,
        tasks: Arc<TaskRegistry>,
        storage: Arc<dyn DataLayer>,
    ) -> Self {
        Self {
            definition,
            params,
            config,
            tasks,
            storage,
        }
    }

    pub fn definition(&self) -> &StateDefinition {
        &self.definition
    }

    /// Evaluate the state.
    ///
    /// `raw_input` is the decoded message payload; `input` is what is left
    /// after InputPath, Parameters and ItemsPath.
    pub async fn evaluate(
        &self,
        ctx: &TaskContext,
        raw_input: &Value,
        input: Value,
    ) -> EngineResult<Evaluation> {
        let invocation = ctx.invocation();
        match &self.definition.kind {
            StateKind::Task(state) => task::execute(&self.tasks, state, ctx, raw_input, input).await,
            StateKind::Choice(state) => {
                let next = select_next(&state.choices, state.default.as_deref(), &input)
                    .map(str::to_string);
                tracing::debug!(state = %self.definition.name, next = ?next, "Choice evaluated");
                Ok(Evaluation::choice(input, next))
            }
            StateKind::Pass(state) => Ok(Evaluation::new(state.result.clone().unwrap_or(input))),
            StateKind::Succeed => Ok(Evaluation::new(input)),
            StateKind::Fail(state) => {
                tracing::warn!(
                    state = %self.definition.name,
                    error = ?state.error,
                    cause = ?state.cause,
                    "Fail state reached"
                );
                Ok(Evaluation::new(input))
            }
            StateKind::Wait(state) => {
                wait::run(state, &input).await?;
                Ok(Evaluation::new(input))
            }
            StateKind::Parallel(state) => self.evaluate_parallel(state, invocation, raw_input, input).await,
            StateKind::Map(state) => self.evaluate_map(state, invocation, raw_input, input).await,
        }
    }
}

impl std::fmt::Debug for StateEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateEvaluator")
            .field("state", &self.definition.name)
            .field("type", &self.definition.state_type())
            .finish()
    }
}
