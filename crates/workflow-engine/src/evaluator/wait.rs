//! Wait state delays.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;

use crate::choice::parse_timestamp;
use crate::definition::WaitState;
use crate::error::{EngineError, EngineResult};

/// Compute how long a Wait state blocks, relative to `now`.
pub fn wait_duration(state: &WaitState, input: &Value, now: DateTime<Utc>) -> EngineResult<Duration> {
    if let Some(seconds) = state.seconds {
        return seconds_to_duration(seconds, "Seconds");
    }

    if let Some(path) = &state.seconds_path {
        let value = path.resolve(input, None)?;
        let seconds = value.as_f64().ok_or_else(|| {
            EngineError::InvalidWait(format!("SecondsPath '{}' selected {}, not a number", path, value))
        })?;
        return seconds_to_duration(seconds, "SecondsPath");
    }

    if let Some(text) = &state.timestamp {
        let target = parse(text)?;
        return Ok(match (target - now).to_std() {
            Ok(remaining) => remaining,
            Err(_) => {
                tracing::warn!(timestamp = %text, "Wait timestamp already passed, not waiting");
                Duration::ZERO
            }
        });
    }

    if let Some(path) = &state.timestamp_path {
        let value = path.resolve(input, None)?;
        let text = value.as_str().ok_or_else(|| {
            EngineError::InvalidWait(format!("TimestampPath '{}' selected {}, not a string", path, value))
        })?;
        let target = parse(text)?;
        return (target - now).to_std().map_err(|_| {
            EngineError::InvalidWait(format!("TimestampPath '{}' is in the past: {}", path, text))
        });
    }

    Err(EngineError::InvalidDefinition(
        "Wait state has no Seconds, SecondsPath, Timestamp or TimestampPath".to_string(),
    ))
}

fn seconds_to_duration(seconds: f64, field: &str) -> EngineResult<Duration> {
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(EngineError::InvalidWait(format!("{} must be non-negative, got {}", field, seconds)));
    }
    Ok(Duration::from_secs_f64(seconds))
}

fn parse(text: &str) -> EngineResult<DateTime<Utc>> {
    parse_timestamp(text)
        .map(|t| t.with_timezone(&Utc))
        .ok_or_else(|| EngineError::InvalidWait(format!("invalid timestamp '{}'", text)))
}

/// Block the invocation for the state's delay.
pub(super) async fn run(state: &WaitState, input: &Value) -> EngineResult<()> {
    let delay = wait_duration(state, input, Utc::now())?;
    tracing::debug!(delay_ms = delay.as_millis() as u64, "Waiting");
    tokio::time::sleep(delay).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{parse_state, StateKind};
    use serde_json::json;

    fn wait_state(fields: Value) -> WaitState {
        let mut definition = json!({"Type": "Wait", "Next": "After"});
        if let (Some(target), Value::Object(fields)) = (definition.as_object_mut(), fields) {
            target.extend(fields);
        }
        match parse_state("W", &definition).unwrap().kind {
            StateKind::Wait(state) => state,
            other => panic!("not a wait: {:?}", other),
        }
    }

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_seconds() {
        let state = wait_state(json!({"Seconds": 2.5}));
        assert_eq!(
            wait_duration(&state, &json!({}), now()).unwrap(),
            Duration::from_millis(2500)
        );
    }

    #[test]
    fn test_seconds_path() {
        let state = wait_state(json!({"SecondsPath": "$.delay"}));
        assert_eq!(
            wait_duration(&state, &json!({"delay": 3}), now()).unwrap(),
            Duration::from_secs(3)
        );

        let err = wait_duration(&state, &json!({"delay": -1}), now()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidWait(_)));

        let err = wait_duration(&state, &json!({}), now()).unwrap_err();
        assert!(matches!(err, EngineError::PathProcessing(_)));
    }

    #[test]
    fn test_timestamp() {
        let state = wait_state(json!({"Timestamp": "2024-05-01T12:00:10Z"}));
        assert_eq!(
            wait_duration(&state, &json!({}), now()).unwrap(),
            Duration::from_secs(10)
        );

        let past = wait_state(json!({"Timestamp": "2024-05-01T11:00:00Z"}));
        assert_eq!(wait_duration(&past, &json!({}), now()).unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_timestamp_path() {
        let state = wait_state(json!({"TimestampPath": "$.until"}));
        assert_eq!(
            wait_duration(&state, &json!({"until": "2024-05-01T14:00:00+02:00"}), now()).unwrap(),
            Duration::ZERO
        );
        assert_eq!(
            wait_duration(&state, &json!({"until": "2024-05-01T12:01:00Z"}), now()).unwrap(),
            Duration::from_secs(60)
        );

        let err = wait_duration(&state, &json!({"until": "2024-05-01T11:59:59Z"}), now()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidWait(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_sleeps() {
        let state = wait_state(json!({"Seconds": 5}));
        let start = tokio::time::Instant::now();
        run(&state, &json!({})).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }
}
