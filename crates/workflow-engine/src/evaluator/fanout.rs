//! Parallel and Map fan-out and fan-in.
//!
//! A fan-out state stores a coordination record before dispatching its
//! branches: a counter in the counter table (target in `Klist`), counter
//! metadata in the counter info table, a copy of the invocation metadata
//! and the state input. The descriptor is also added to the outgoing
//! metadata so every branch state can find its output slot and counter.
//!
//! Each branch's terminal state writes its output to its slot, records the
//! slot key in a shared set and increments the counter. The increment that
//! reaches the target sends a continuation back to the fan-out state, which
//! collects the outputs and moves on (Parallel) or dispatches the next
//! batch (Map).

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{Evaluation, StateEvaluator};
use crate::definition::{MapState, ParallelState};
use crate::error::{EngineError, EngineResult};
use crate::invocation::{map_slot_from_instance_id, InvocationContext};
use crate::metadata::{Metadata, StateAction};
use crate::path::{apply_input_path, map_item_context, render_parameters};
use crate::retry::Backoff;
use crate::trigger::Trigger;

/// Metadata key holding a Parallel state's descriptor.
pub fn parallel_info_key(state: &str, execution_id: &str) -> String {
    format!("{}_{}_parallel_info", state, execution_id)
}

/// Metadata key holding a Map state's descriptor.
pub fn map_info_key(state: &str, execution_id: &str) -> String {
    format!("{}_{}_map_info", state, execution_id)
}

/// Coordination descriptor carried in metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CoordinationInfo {
    pub counter_name: String,
    /// One output slot per dispatched branch, in branch order.
    pub branch_output_keys: Vec<String>,
    pub branch_output_keys_set_key: String,
    /// Counter targets; the last one is current.
    pub klist: Vec<i64>,
    pub total_branches: usize,
    pub workflow_instance_metadata_storage_key: String,
    #[serde(default)]
    pub max_concurrency: usize,
}

impl CoordinationInfo {
    pub fn target(&self) -> i64 {
        self.klist
            .last()
            .copied()
            .unwrap_or(self.total_branches as i64)
    }
}

/// Record stored next to the counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CounterMetadata {
    #[serde(rename = "__state_action")]
    pub state_action: StateAction,
    #[serde(rename = "__async_execution")]
    pub async_execution: bool,
    pub workflow_instance_metadata_storage_key: String,
    pub counter_value: i64,
    pub klist: Vec<i64>,
    pub total_branches: usize,
    pub execution_id: String,
    pub function_topic: String,
}

/// Input of a fan-in continuation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContinuationInput {
    pub counter_value: i64,
    pub workflow_instance_metadata_storage_key: String,
}

/// Storage key names for one fan-out state in one workflow run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanOutKeys {
    prefix: String,
    state: String,
    execution_id: String,
}

impl FanOutKeys {
    pub fn new(state_topic: &str, state: &str, execution_id: &str) -> Self {
        Self {
            prefix: format!("{}_{}", state_topic, execution_id),
            state: state.to_string(),
            execution_id: execution_id.to_string(),
        }
    }

    pub fn counter(&self) -> String {
        format!("{}_counter", self.prefix)
    }

    pub fn counter_metadata(&self) -> String {
        format!("{}_metadata", self.counter())
    }

    pub fn workflow_metadata(&self) -> String {
        format!("{}_workflow_metadata", self.prefix)
    }

    pub fn state_input(&self) -> String {
        format!("{}_state_input", self.prefix)
    }

    pub fn output_set(&self) -> String {
        format!("{}_{}_outputkeys_set", self.execution_id, self.state)
    }

    /// Output slot of Parallel branch `n` (1-based).
    pub fn parallel_branch(&self, n: usize) -> String {
        format!("{}_branch_{}", self.prefix, n)
    }

    /// Output slot of Map iteration `n` (1-based) within the current batch.
    pub fn map_branch(&self, n: usize) -> String {
        format!("{}-branch-{}", self.prefix, n)
    }

    pub fn map_pending(&self) -> String {
        format!("{}_tobeProcessedlater", self.prefix)
    }

    pub fn map_partial(&self) -> String {
        format!("{}_mapStatePartialResult", self.prefix)
    }

    pub fn map_input_count(&self) -> String {
        format!("{}_mapInputCount", self.prefix)
    }

    /// Input the Map Parameters template resolves `$` against.
    pub fn map_parameters_input(&self) -> String {
        format!("{}_mapParametersInput", self.prefix)
    }
}

fn coordination(message: impl Into<String>) -> EngineError {
    EngineError::Coordination(message.into())
}

/// Number of items in the next Map batch.
fn batch_limit(max_concurrency: usize, available: usize) -> usize {
    if max_concurrency == 0 {
        available
    } else {
        max_concurrency.min(available)
    }
}

impl StateEvaluator {
    fn fan_out_keys(&self, execution_id: &str) -> FanOutKeys {
        FanOutKeys::new(
            &self.params.state_topic(),
            &self.definition.name,
            execution_id,
        )
    }

    pub(super) async fn evaluate_parallel(
        &self,
        state: &ParallelState,
        ctx: &InvocationContext,
        raw_input: &Value,
        input: Value,
    ) -> EngineResult<Evaluation> {
        match ctx.state_action() {
            None => self.start_parallel(state, ctx, raw_input, input).await,
            Some(StateAction::PostParallelProcessing) => self.finish_parallel(ctx, input).await,
            Some(other) => Err(coordination(format!(
                "unexpected {} for Parallel state '{}'",
                other, self.definition.name
            ))),
        }
    }

    async fn start_parallel(
        &self,
        state: &ParallelState,
        ctx: &InvocationContext,
        raw_input: &Value,
        input: Value,
    ) -> EngineResult<Evaluation> {
        let execution_id = ctx.execution_id();
        let keys = self.fan_out_keys(&execution_id);
        let branches = state.branches.len();

        let info = CoordinationInfo {
            counter_name: keys.counter(),
            branch_output_keys: (1..=branches).map(|n| keys.parallel_branch(n)).collect(),
            branch_output_keys_set_key: keys.output_set(),
            klist: vec![branches as i64],
            total_branches: branches,
            workflow_instance_metadata_storage_key: keys.workflow_metadata(),
            max_concurrency: 0,
        };
        self.open_coordination(
            ctx,
            &keys,
            &info,
            StateAction::PostParallelProcessing,
            parallel_info_key(&self.definition.name, &execution_id),
        )
        .await?;
        self.storage
            .put(
                &self.params.workflow_scope(),
                &keys.state_input(),
                &serde_json::to_string(raw_input)?,
            )
            .await?;

        for branch in &state.branches {
            ctx.add_trigger(Trigger::new(branch.start_at.clone(), input.clone()));
        }

        tracing::debug!(
            execution_id = %execution_id,
            state = %self.definition.name,
            branches,
            "Parallel fan-out"
        );
        Ok(Evaluation::suppressed(input))
    }

    async fn finish_parallel(&self, ctx: &InvocationContext, input: Value) -> EngineResult<Evaluation> {
        let continuation = parse_continuation(input)?;
        let metadata = self
            .restore_metadata(ctx, &continuation.workflow_instance_metadata_storage_key)
            .await?;
        let execution_id = ctx.execution_id();
        let info_key = parallel_info_key(&self.definition.name, &execution_id);
        let info: CoordinationInfo = metadata
            .get_extra(&info_key)?
            .ok_or_else(|| coordination(format!("metadata has no '{}'", info_key)))?;
        let keys = self.fan_out_keys(&execution_id);

        let outputs = self.collect_branch_outputs(&info).await?;
        self.close_counter(&info, &keys, continuation.counter_value).await?;

        let scope = self.params.workflow_scope();
        self.storage
            .delete(&scope, &info.workflow_instance_metadata_storage_key)
            .await?;
        let state_input = self.take_state_input(&keys).await?;
        ctx.update_metadata(|m| m.extra.remove(&info_key));

        tracing::debug!(
            execution_id = %execution_id,
            state = %self.definition.name,
            branches = outputs.len(),
            "Parallel fan-in complete"
        );
        Ok(Evaluation::new(Value::Array(outputs)).with_state_input(state_input))
    }

    pub(super) async fn evaluate_map(
        &self,
        state: &MapState,
        ctx: &InvocationContext,
        raw_input: &Value,
        input: Value,
    ) -> EngineResult<Evaluation> {
        match ctx.state_action() {
            None => self.start_map(state, ctx, raw_input, input).await,
            Some(StateAction::PostMapProcessing) => self.continue_map(state, ctx, input).await,
            Some(other) => Err(coordination(format!(
                "unexpected {} for Map state '{}'",
                other, self.definition.name
            ))),
        }
    }

    async fn start_map(
        &self,
        state: &MapState,
        ctx: &InvocationContext,
        raw_input: &Value,
        input: Value,
    ) -> EngineResult<Evaluation> {
        let mut items = match input {
            Value::Array(items) => items,
            other => {
                return Err(EngineError::PathProcessing(format!(
                    "Map state '{}' needs an array of items, got {}",
                    self.definition.name, other
                )))
            }
        };
        if items.is_empty() {
            return Ok(Evaluation::new(json!([])).with_state_input(raw_input.clone()));
        }

        let execution_id = ctx.execution_id();
        let keys = self.fan_out_keys(&execution_id);
        let scope = self.params.workflow_scope();
        let total = items.len();
        let pending = items.split_off(batch_limit(state.max_concurrency, total));

        self.storage
            .put(&scope, &keys.map_input_count(), &total.to_string())
            .await?;
        self.storage.put(&scope, &keys.map_partial(), "[]").await?;
        self.storage
            .put(&scope, &keys.map_pending(), &serde_json::to_string(&pending)?)
            .await?;
        self.storage
            .put(&scope, &keys.state_input(), &serde_json::to_string(raw_input)?)
            .await?;
        let parameters_input = apply_input_path(&self.definition.input_path, raw_input.clone())?;
        self.storage
            .put(
                &scope,
                &keys.map_parameters_input(),
                &serde_json::to_string(&parameters_input)?,
            )
            .await?;

        tracing::debug!(
            execution_id = %execution_id,
            state = %self.definition.name,
            total,
            batch = items.len(),
            "Map fan-out"
        );
        self.dispatch_map_batch(state, ctx, &keys, items, 0, &parameters_input)
            .await?;
        Ok(Evaluation::suppressed(Value::Null))
    }

    async fn dispatch_map_batch(
        &self,
        state: &MapState,
        ctx: &InvocationContext,
        keys: &FanOutKeys,
        batch: Vec<Value>,
        start_index: usize,
        parameters_input: &Value,
    ) -> EngineResult<()> {
        let size = batch.len();
        let info = CoordinationInfo {
            counter_name: keys.counter(),
            branch_output_keys: (1..=size).map(|n| keys.map_branch(n)).collect(),
            branch_output_keys_set_key: keys.output_set(),
            klist: vec![size as i64],
            total_branches: size,
            workflow_instance_metadata_storage_key: keys.workflow_metadata(),
            max_concurrency: state.max_concurrency,
        };
        self.open_coordination(
            ctx,
            keys,
            &info,
            StateAction::PostMapProcessing,
            map_info_key(&self.definition.name, &ctx.execution_id()),
        )
        .await?;

        for (offset, item) in batch.into_iter().enumerate() {
            let value = match &self.definition.parameters {
                Some(template) => render_parameters(
                    template,
                    parameters_input,
                    Some(&map_item_context(&item, start_index + offset)),
                )?,
                None => item,
            };
            ctx.add_trigger(Trigger::map_branch(state.iterator.start_at.clone(), value));
        }
        Ok(())
    }

    async fn continue_map(
        &self,
        state: &MapState,
        ctx: &InvocationContext,
        input: Value,
    ) -> EngineResult<Evaluation> {
        let continuation = parse_continuation(input)?;
        let metadata = self
            .restore_metadata(ctx, &continuation.workflow_instance_metadata_storage_key)
            .await?;
        let execution_id = ctx.execution_id();
        let info_key = map_info_key(&self.definition.name, &execution_id);
        let info: CoordinationInfo = metadata
            .get_extra(&info_key)?
            .ok_or_else(|| coordination(format!("metadata has no '{}'", info_key)))?;
        let keys = self.fan_out_keys(&execution_id);
        let scope = self.params.workflow_scope();

        let outputs = self.collect_branch_outputs(&info).await?;
        self.close_counter(&info, &keys, continuation.counter_value).await?;

        let mut partial: Vec<Value> = self.read_json(&keys.map_partial()).await?;
        partial.extend(outputs);
        let total: usize = self.read_json(&keys.map_input_count()).await?;
        let mut pending: Vec<Value> = self.read_json(&keys.map_pending()).await?;

        if !pending.is_empty() {
            let parameters_input: Value = self.read_json(&keys.map_parameters_input()).await?;
            let rest = pending.split_off(batch_limit(state.max_concurrency, pending.len()));
            self.storage
                .put(&scope, &keys.map_partial(), &serde_json::to_string(&partial)?)
                .await?;
            self.storage
                .put(&scope, &keys.map_pending(), &serde_json::to_string(&rest)?)
                .await?;

            tracing::debug!(
                execution_id = %execution_id,
                state = %self.definition.name,
                done = partial.len(),
                total,
                batch = pending.len(),
                "Map dispatching next batch"
            );
            self.dispatch_map_batch(state, ctx, &keys, pending, partial.len(), &parameters_input)
                .await?;
            return Ok(Evaluation::suppressed(Value::Null));
        }

        if partial.len() != total {
            return Err(coordination(format!(
                "Map state '{}' collected {} of {} results with nothing left to dispatch",
                self.definition.name,
                partial.len(),
                total
            )));
        }

        for key in [
            keys.map_partial(),
            keys.map_pending(),
            keys.map_input_count(),
            keys.map_parameters_input(),
            info.workflow_instance_metadata_storage_key.clone(),
        ] {
            self.storage.delete(&scope, &key).await?;
        }
        let state_input = self.take_state_input(&keys).await?;
        ctx.update_metadata(|m| m.extra.remove(&info_key));

        tracing::debug!(
            execution_id = %execution_id,
            state = %self.definition.name,
            total,
            "Map fan-in complete"
        );
        Ok(Evaluation::new(Value::Array(partial)).with_state_input(state_input))
    }

    /// Create the counter, counter metadata and metadata copy for one fan-out.
    async fn open_coordination(
        &self,
        ctx: &InvocationContext,
        keys: &FanOutKeys,
        info: &CoordinationInfo,
        action: StateAction,
        info_key: String,
    ) -> EngineResult<()> {
        let execution_id = ctx.execution_id();
        let scope = self.params.workflow_scope();

        self.storage
            .create_counter(&self.params.counter_scope(), &info.counter_name, 0)
            .await?;
        let counter_metadata = CounterMetadata {
            state_action: action,
            async_execution: ctx.metadata().async_execution,
            workflow_instance_metadata_storage_key: info
                .workflow_instance_metadata_storage_key
                .clone(),
            counter_value: info.target(),
            klist: info.klist.clone(),
            total_branches: info.total_branches,
            execution_id: execution_id.clone(),
            function_topic: self.params.state_topic(),
        };
        self.storage
            .put(
                &self.params.counter_info_scope(),
                &keys.counter_metadata(),
                &serde_json::to_string(&counter_metadata)?,
            )
            .await?;
        self.storage
            .create_set(&scope, &info.branch_output_keys_set_key)
            .await?;

        ctx.update_metadata(|m| m.set_extra(info_key, info))?;
        let metadata = ctx.metadata();
        self.storage
            .put(
                &scope,
                &info.workflow_instance_metadata_storage_key,
                &serde_json::to_string(&metadata)?,
            )
            .await?;
        Ok(())
    }

    /// Swap in the metadata stored at fan-out, keeping this hop's identity.
    async fn restore_metadata(&self, ctx: &InvocationContext, key: &str) -> EngineResult<Metadata> {
        let text = self
            .storage
            .get(&self.params.workflow_scope(), key)
            .await?
            .ok_or_else(|| coordination(format!("stored metadata '{}' not found", key)))?;
        let mut stored: Metadata = serde_json::from_str(&text)
            .map_err(|e| coordination(format!("stored metadata '{}': {}", key, e)))?;

        Ok(ctx.update_metadata(|current| {
            stored.function_execution_id = current.function_execution_id.clone();
            stored.state_counter = current.state_counter;
            stored.state_action = None;
            *current = stored.clone();
            stored
        }))
    }

    /// Gather branch outputs in slot order, then drop the slots and the set.
    ///
    /// Waits up to the fan-in deadline for every slot to be reported and
    /// readable. Slots still missing after that become `null`.
    async fn collect_branch_outputs(&self, info: &CoordinationInfo) -> EngineResult<Vec<Value>> {
        let scope = self.params.workflow_scope();
        let set_key = &info.branch_output_keys_set_key;
        let expected = info.branch_output_keys.len();
        let mut backoff = Backoff::new(
            self.config.fan_in_poll_initial(),
            self.config.fan_in_poll_max(),
            self.config.fan_in_timeout(),
        );

        let mut reported = self.storage.retrieve_set(&scope, set_key).await?;
        while reported.len() < expected && backoff.wait().await {
            reported = self.storage.retrieve_set(&scope, set_key).await?;
        }
        if reported.is_empty() {
            return Err(coordination(format!("branch output set '{}' is empty", set_key)));
        }
        if reported.len() < expected {
            tracing::warn!(
                set = %set_key,
                reported = reported.len(),
                expected,
                "Fan-in deadline passed with branches missing"
            );
        }

        let mut outputs = Vec::with_capacity(expected);
        for key in &info.branch_output_keys {
            if !reported.contains(key) {
                tracing::warn!(key = %key, "Branch never reported, using null");
                outputs.push(Value::Null);
                continue;
            }

            let mut value = self.storage.get(&scope, key).await?;
            while value.is_none() && backoff.wait().await {
                value = self.storage.get(&scope, key).await?;
            }
            match value {
                Some(text) => outputs.push(
                    serde_json::from_str(&text)
                        .map_err(|e| coordination(format!("branch output '{}': {}", key, e)))?,
                ),
                None => {
                    tracing::warn!(key = %key, "Branch output unreadable, using null");
                    outputs.push(Value::Null);
                }
            }
            self.storage.delete(&scope, key).await?;
        }
        self.storage.delete_set(&scope, set_key).await?;
        Ok(outputs)
    }

    /// Drop the counter and its metadata once the batch is complete.
    async fn close_counter(
        &self,
        info: &CoordinationInfo,
        keys: &FanOutKeys,
        counter_value: i64,
    ) -> EngineResult<()> {
        let info_scope = self.params.counter_info_scope();
        let target = match self.storage.get(&info_scope, &keys.counter_metadata()).await? {
            Some(text) => serde_json::from_str::<CounterMetadata>(&text)
                .map(|m| m.klist.last().copied().unwrap_or(m.counter_value))
                .unwrap_or_else(|_| info.target()),
            None => info.target(),
        };

        if counter_value != target {
            return Err(coordination(format!(
                "continuation for '{}' at {} but target is {}",
                info.counter_name, counter_value, target
            )));
        }

        self.storage
            .delete_counter(&self.params.counter_scope(), &info.counter_name)
            .await?;
        self.storage.delete(&info_scope, &keys.counter_metadata()).await?;
        Ok(())
    }

    async fn take_state_input(&self, keys: &FanOutKeys) -> EngineResult<Value> {
        let scope = self.params.workflow_scope();
        let key = keys.state_input();
        let value = match self.storage.get(&scope, &key).await? {
            Some(text) => serde_json::from_str(&text)?,
            None => json!({}),
        };
        self.storage.delete(&scope, &key).await?;
        Ok(value)
    }

    async fn read_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> EngineResult<T> {
        let text = self
            .storage
            .get(&self.params.workflow_scope(), key)
            .await?
            .ok_or_else(|| coordination(format!("'{}' not found", key)))?;
        serde_json::from_str(&text).map_err(|e| coordination(format!("'{}': {}", key, e)))
    }

    /// Branch-terminal bookkeeping.
    ///
    /// Called when a terminal state inside a Parallel branch or Map iteration
    /// finishes: stores the output in the branch's slot and bumps the
    /// counter, emitting the fan-in continuation when it reaches the target.
    pub async fn record_branch_completion(
        &self,
        ctx: &InvocationContext,
        output: &Value,
    ) -> EngineResult<()> {
        let execution_id = ctx.execution_id();
        let metadata = ctx.metadata();

        if let Some(parent) = &self.definition.parent_parallel_info {
            let info_key = parallel_info_key(&parent.name, &execution_id);
            let info: CoordinationInfo = metadata
                .get_extra(&info_key)?
                .ok_or_else(|| coordination(format!("metadata has no '{}'", info_key)))?;
            let slot = parent.branch_counter.checked_sub(1).ok_or_else(|| {
                coordination(format!("branch counter of '{}' must be 1-based", self.definition.name))
            })?;
            self.report_branch(ctx, &parent.name, &info, slot, output, StateAction::PostParallelProcessing)
                .await?;
        }

        if let Some(parent) = &self.definition.parent_map_info {
            let info_key = map_info_key(&parent.name, &execution_id);
            let info: CoordinationInfo = metadata
                .get_extra(&info_key)?
                .ok_or_else(|| coordination(format!("metadata has no '{}'", info_key)))?;
            let function_execution_id = ctx.function_execution_id();
            let slot = map_slot_from_instance_id(&function_execution_id).ok_or_else(|| {
                coordination(format!(
                    "'{}' does not identify a Map iteration",
                    function_execution_id
                ))
            })?;
            self.report_branch(ctx, &parent.name, &info, slot, output, StateAction::PostMapProcessing)
                .await?;
        }

        Ok(())
    }

    async fn report_branch(
        &self,
        ctx: &InvocationContext,
        parent: &str,
        info: &CoordinationInfo,
        slot: usize,
        output: &Value,
        action: StateAction,
    ) -> EngineResult<()> {
        let scope = self.params.workflow_scope();
        let output_key = info.branch_output_keys.get(slot).ok_or_else(|| {
            coordination(format!(
                "slot {} out of range for {} branches of '{}'",
                slot,
                info.branch_output_keys.len(),
                parent
            ))
        })?;

        self.storage
            .put(&scope, output_key, &serde_json::to_string(output)?)
            .await?;
        self.storage
            .add_set_entry(&scope, &info.branch_output_keys_set_key, output_key)
            .await?;
        let value = self
            .storage
            .increment_counter(&self.params.counter_scope(), &info.counter_name, 1)
            .await?;
        let target = info.target();

        tracing::debug!(
            execution_id = %ctx.execution_id(),
            parent = %parent,
            slot,
            counter = value,
            target,
            "Branch completed"
        );

        if value == target {
            let continuation = ContinuationInput {
                counter_value: value,
                workflow_instance_metadata_storage_key: info
                    .workflow_instance_metadata_storage_key
                    .clone(),
            };
            ctx.add_trigger(Trigger::continuation(
                parent,
                action,
                serde_json::to_value(&continuation)?,
            ));
        }
        Ok(())
    }
}

fn parse_continuation(input: Value) -> EngineResult<ContinuationInput> {
    serde_json::from_value(input).map_err(|e| coordination(format!("bad continuation input: {}", e)))
}
