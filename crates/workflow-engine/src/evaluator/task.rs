//! Task execution with Retry and Catch.

use serde_json::{json, Value};

use super::Evaluation;
use crate::definition::TaskState;
use crate::error::{EngineError, EngineResult};
use crate::path::apply_result_path;
use crate::tasks::{TaskContext, TaskRegistry};

/// Run a Task state's resource.
///
/// With a Retry list, a matching error is retried with backoff and, once
/// the attempts run out, turned into an `{Error, Cause}` result. Catch is
/// only consulted when there is no Retry list: a matching error is routed
/// to the catcher's Next and the state's own Next is dropped.
pub(super) async fn execute(
    tasks: &TaskRegistry,
    state: &TaskState,
    ctx: &TaskContext,
    raw_input: &Value,
    input: Value,
) -> EngineResult<Evaluation> {
    let invoke = move |input: Value| tasks.invoke(&state.resource, input, ctx);

    if !state.retry.is_empty() {
        let first = match invoke(input.clone()).await {
            Ok(output) => return Ok(Evaluation::new(output)),
            Err(error) => error,
        };
        let Some(retrier) = state.retry.iter().find(|r| r.matches(&first)) else {
            return Err(first);
        };

        let mut last = first;
        for attempt in 1..=retrier.max_attempts {
            let delay = retrier.delay_for(attempt);
            tracing::warn!(
                resource = %state.resource,
                attempt,
                max_attempts = retrier.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %last,
                "Task failed, retrying"
            );
            tokio::time::sleep(delay).await;

            match invoke(input.clone()).await {
                Ok(output) => return Ok(Evaluation::new(output)),
                Err(error) if retrier.matches(&error) => last = error,
                Err(error) => return Err(error),
            }
        }

        tracing::error!(
            resource = %state.resource,
            error = %last,
            "Task retries exhausted"
        );
        return Ok(Evaluation::new(error_payload(&last)));
    }

    if !state.catch.is_empty() {
        let error = match invoke(input).await {
            Ok(output) => return Ok(Evaluation::new(output)),
            Err(error) => error,
        };
        let Some(catcher) = state.catch.iter().find(|c| c.matches(&error)) else {
            return Err(error);
        };

        tracing::warn!(
            resource = %state.resource,
            next = %catcher.next,
            error = %error,
            "Task error caught"
        );
        let value = apply_result_path(&catcher.result_path, raw_input, error_payload(&error))?;
        ctx.add_dynamic_next(catcher.next.clone(), value.clone());
        return Ok(Evaluation::suppressed(value));
    }

    invoke(input).await.map(Evaluation::new)
}

fn error_payload(error: &EngineError) -> Value {
    json!({ "Error": error.error_type(), "Cause": error.message() })
}
