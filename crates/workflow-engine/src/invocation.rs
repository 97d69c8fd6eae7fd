//! Per-invocation execution context.
//!
//! Holds everything one invocation accumulates before publish: its
//! metadata, dynamically added triggers, per-topic output counters and
//! buffered storage writes. Nothing here is shared across invocations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::metadata::{Metadata, StateAction};
use crate::trigger::Trigger;

/// Marker appended to ids derived for Map iterations.
pub const MAP_BRANCH_MARKER: &str = "-M";

/// Storage write requested by a task and applied at publish time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingWrite {
    Put { key: String, value: String },
    Delete { key: String },
}

#[derive(Debug, Default)]
struct InvocationState {
    metadata: Metadata,
    triggers: Vec<Trigger>,
    output_counters: HashMap<String, u64>,
    pending_writes: Vec<PendingWrite>,
}

/// Shared handle to one invocation's state.
#[derive(Debug, Clone, Default)]
pub struct InvocationContext {
    inner: Arc<Mutex<InvocationState>>,
}

impl InvocationContext {
    /// Create a context for an incoming message's metadata.
    pub fn new(metadata: Metadata) -> Self {
        Self {
            inner: Arc::new(Mutex::new(InvocationState {
                metadata,
                ..Default::default()
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, InvocationState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the current metadata.
    pub fn metadata(&self) -> Metadata {
        self.state().metadata.clone()
    }

    /// Mutate the metadata in place.
    pub fn update_metadata<T>(&self, f: impl FnOnce(&mut Metadata) -> T) -> T {
        f(&mut self.state().metadata)
    }

    pub fn execution_id(&self) -> String {
        self.state().metadata.execution_id.clone()
    }

    pub fn function_execution_id(&self) -> String {
        self.state().metadata.function_execution_id.clone()
    }

    pub fn state_action(&self) -> Option<StateAction> {
        self.state().metadata.state_action
    }

    /// Queue a trigger for publish.
    pub fn add_trigger(&self, trigger: Trigger) {
        self.state().triggers.push(trigger);
    }

    /// Take every queued trigger.
    pub fn take_triggers(&self) -> Vec<Trigger> {
        std::mem::take(&mut self.state().triggers)
    }

    /// Derive the function-execution-id for the next message to `topic`.
    ///
    /// Ids are `<parent>_<n>` where `n` counts messages to that topic within
    /// this invocation, starting at 1.
    pub fn next_instance_id(&self, topic: &str, map_branch: bool) -> String {
        let mut state = self.state();
        let counter = state.output_counters.entry(topic.to_string()).or_insert(0);
        *counter += 1;
        let n = *counter;
        let marker = if map_branch { MAP_BRANCH_MARKER } else { "" };
        format!("{}_{}{}", state.metadata.function_execution_id, n, marker)
    }

    /// Buffer a put.
    pub fn queue_put(&self, key: impl Into<String>, value: impl Into<String>) {
        self.state().pending_writes.push(PendingWrite::Put {
            key: key.into(),
            value: value.into(),
        });
    }

    /// Buffer a delete.
    pub fn queue_delete(&self, key: impl Into<String>) {
        self.state()
            .pending_writes
            .push(PendingWrite::Delete { key: key.into() });
    }

    /// Take buffered writes in request order.
    pub fn take_pending_writes(&self) -> Vec<PendingWrite> {
        std::mem::take(&mut self.state().pending_writes)
    }
}

/// Index of the Map iteration slot encoded in a function-execution-id.
///
/// The last `_`-separated segment carrying the Map marker wins, so nested
/// Maps resolve to the innermost one. Returns the 0-based slot.
pub fn map_slot_from_instance_id(id: &str) -> Option<usize> {
    id.split('_')
        .skip(1)
        .filter_map(|segment| segment.strip_suffix(MAP_BRANCH_MARKER))
        .last()
        .and_then(|n| n.parse::<usize>().ok())
        .and_then(|n| n.checked_sub(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_instance_ids_are_distinct_per_topic() {
        let ctx = InvocationContext::new(Metadata::new("exec"));
        assert_eq!(ctx.next_instance_id("a", false), "exec_1");
        assert_eq!(ctx.next_instance_id("a", false), "exec_2");
        assert_eq!(ctx.next_instance_id("b", false), "exec_1");
        assert_eq!(ctx.next_instance_id("w", true), "exec_1-M");
    }

    #[test]
    fn test_map_slot_parsing() {
        assert_eq!(map_slot_from_instance_id("exec_2-M"), Some(1));
        assert_eq!(map_slot_from_instance_id("exec_1-M_1_1"), Some(0));
        assert_eq!(map_slot_from_instance_id("exec_3-M_1_2-M_1"), Some(1));
        assert_eq!(map_slot_from_instance_id("exec_1_2"), None);
        assert_eq!(map_slot_from_instance_id("exec-M"), None);
    }

    #[test]
    fn test_triggers_and_writes_are_taken_once() {
        let ctx = InvocationContext::new(Metadata::new("exec"));
        ctx.add_trigger(Trigger::new("A", json!(1)));
        ctx.queue_put("k", "v");
        ctx.queue_delete("old");

        assert_eq!(ctx.take_triggers().len(), 1);
        assert!(ctx.take_triggers().is_empty());
        assert_eq!(
            ctx.take_pending_writes(),
            vec![
                PendingWrite::Put {
                    key: "k".into(),
                    value: "v".into()
                },
                PendingWrite::Delete { key: "old".into() },
            ]
        );
    }

    #[test]
    fn test_update_metadata() {
        let ctx = InvocationContext::new(Metadata::new("exec"));
        ctx.update_metadata(|m| m.state_counter = 7);
        assert_eq!(ctx.metadata().state_counter, 7);
    }
}
