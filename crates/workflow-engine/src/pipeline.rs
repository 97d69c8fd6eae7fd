//! Execution pipeline: one pass per received message.

use serde_json::Value;
use std::sync::Arc;

use crate::config::{EngineConfig, FunctionParams};
use crate::definition::{StateDefinition, StateKind};
use crate::error::{EngineError, EngineResult};
use crate::evaluator::{Evaluation, StateEvaluator, Transition};
use crate::invocation::InvocationContext;
use crate::metadata::{decode_input, Envelope};
use crate::path::{
    apply_input_path, apply_items_path, apply_output_path, apply_result_path, render_parameters,
};
use crate::publisher::{PublishReport, RecoveryMessageType, TriggerPublisher};
use crate::queue::{KeyedMessage, MessageQueue};
use crate::storage::DataLayer;
use crate::tasks::{TaskContext, TaskRegistry};
use crate::trigger::Trigger;

/// Outcome of one invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationReport {
    pub execution_id: String,
    pub function_execution_id: String,
    /// State output, when the invocation succeeded.
    pub output: Option<Value>,
    /// Class name of the error the invocation failed with.
    pub error_type: Option<String>,
    pub publish: PublishReport,
}

/// Runs the hosted state for each incoming message.
pub struct ExecutionPipeline {
    definition: Arc<StateDefinition>,
    config: EngineConfig,
    evaluator: StateEvaluator,
    publisher: Arc<TriggerPublisher>,
    storage: Arc<dyn DataLayer>,
    params: Arc<FunctionParams>,
}

impl ExecutionPipeline {
    /// Build the pipeline for the state described by `params`.
    pub fn new(
        params: FunctionParams,
        config: EngineConfig,
        tasks: TaskRegistry,
        queue: Arc<dyn MessageQueue>,
        storage: Arc<dyn DataLayer>,
    ) -> EngineResult<Self> {
        let definition = Arc::new(params.definition()?);
        if let StateKind::Task(task) = &definition.kind {
            if !tasks.has(&task.resource) {
                tracing::warn!(
                    state = %definition.name,
                    resource = %task.resource,
                    "Task resource is not registered"
                );
            }
        }

        let params = Arc::new(params);
        let publisher = Arc::new(TriggerPublisher::new(
            params.clone(),
            queue,
            storage.clone(),
        ));
        let evaluator = StateEvaluator::new(
            definition.clone(),
            params.clone(),
            config.clone(),
            Arc::new(tasks),
            storage.clone(),
        );

        Ok(Self {
            definition,
            config,
            evaluator,
            publisher,
            storage,
            params,
        })
    }

    pub fn definition(&self) -> &StateDefinition {
        &self.definition
    }

    pub fn params(&self) -> &FunctionParams {
        &self.params
    }

    pub fn publisher(&self) -> &Arc<TriggerPublisher> {
        &self.publisher
    }

    /// Handle one invocation message end to end.
    ///
    /// Only a message that cannot be decapsulated, or a failed error
    /// publish, is returned as an error; every other failure is published
    /// to the Exit topic and reported in the returned value.
    pub async fn handle_message(&self, message: &KeyedMessage) -> EngineResult<InvocationReport> {
        let envelope = Envelope::decapsulate(&message.value)?;
        let mut metadata = envelope.metadata;
        metadata.state_counter += 1;

        let ctx = InvocationContext::new(metadata);
        let task_ctx = TaskContext::new(
            ctx.clone(),
            self.publisher.clone(),
            self.storage.clone(),
            self.params.workflow_scope(),
        );
        let execution_id = ctx.execution_id();
        let function_execution_id = ctx.function_execution_id();

        tracing::debug!(
            execution_id = %execution_id,
            function_execution_id = %function_execution_id,
            state = %self.definition.name,
            "Invocation started"
        );
        self.notify_recovery(&ctx, RecoveryMessageType::Start, None).await;

        let (output, publish, error) = match self.execute(&task_ctx, &envelope.user_data).await {
            Ok((output, triggers)) => {
                let encoded = serde_json::to_string(&output)?;
                match self.publisher.publish(&ctx, &encoded, triggers, None).await {
                    Ok(report) => (Some(output), report, None),
                    Err(e) => {
                        let report = self.publisher.publish(&ctx, "", Vec::new(), Some(&e)).await?;
                        (None, report, Some(e))
                    }
                }
            }
            Err(e) => {
                let report = self.publisher.publish(&ctx, "", Vec::new(), Some(&e)).await?;
                (None, report, Some(e))
            }
        };

        self.notify_recovery(&ctx, RecoveryMessageType::Finish, error.as_ref())
            .await;

        Ok(InvocationReport {
            execution_id,
            function_execution_id,
            output,
            error_type: error.map(|e| e.error_type().to_string()),
            publish,
        })
    }

    async fn notify_recovery(
        &self,
        ctx: &InvocationContext,
        message_type: RecoveryMessageType,
        error: Option<&EngineError>,
    ) {
        if let Err(e) = self.publisher.notify_recovery(ctx, message_type, error).await {
            tracing::warn!(error = %e, "Recovery manager notification failed");
        }
    }

    /// Everything between decapsulation and publish.
    async fn execute(
        &self,
        task_ctx: &TaskContext,
        user_data: &str,
    ) -> EngineResult<(Value, Vec<Trigger>)> {
        let ctx = task_ctx.invocation();
        let state_counter = ctx.metadata().state_counter;
        if state_counter > self.config.max_state_transitions {
            return Err(EngineError::TransitionLimit(state_counter));
        }

        let raw_input = decode_input(user_data)?;
        let input = if ctx.state_action().is_some() {
            raw_input.clone()
        } else {
            self.prepare_input(raw_input.clone())?
        };

        let evaluation = self.evaluator.evaluate(task_ctx, &raw_input, input).await?;

        let Evaluation {
            output,
            transition,
            state_input,
        } = evaluation;

        // Fan-out, batch continuation and Catch outputs are not the state's result.
        let output = match transition {
            Transition::Suppressed => output,
            _ => {
                let base = state_input.as_ref().unwrap_or(&raw_input);
                let result = apply_result_path(&self.definition.result_path, base, output)?;
                apply_output_path(&self.definition.output_path, result)?
            }
        };

        let mut triggers = Vec::new();
        match transition {
            Transition::Static if self.definition.is_terminal() && self.definition.in_branch() => {
                self.evaluator.record_branch_completion(ctx, &output).await?;
            }
            Transition::Static => {
                if let Some(next) = self.definition.static_next() {
                    triggers.push(Trigger::new(next, output.clone()));
                }
            }
            Transition::Choice(Some(next)) => triggers.push(Trigger::new(next, output.clone())),
            Transition::Choice(None) => {
                tracing::debug!(state = %self.definition.name, "No choice matched and no Default");
            }
            Transition::Suppressed => {}
        }
        triggers.extend(ctx.take_triggers());

        Ok((output, triggers))
    }

    /// InputPath, then Parameters (per item for Map), then ItemsPath.
    fn prepare_input(&self, raw_input: Value) -> EngineResult<Value> {
        let selected = apply_input_path(&self.definition.input_path, raw_input)?;
        match &self.definition.kind {
            StateKind::Map(map) => apply_items_path(&map.items_path, selected),
            _ => match &self.definition.parameters {
                Some(template) => render_parameters(template, &selected, None),
                None => Ok(selected),
            },
        }
    }
}

impl std::fmt::Debug for ExecutionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionPipeline")
            .field("state", &self.definition.name)
            .field("evaluator", &self.evaluator)
            .field("publisher", &self.publisher)
            .finish()
    }
}
