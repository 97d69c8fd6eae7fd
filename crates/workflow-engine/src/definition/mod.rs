//! State definitions.

pub mod parser;
pub mod types;

pub use parser::{parse_state, parse_state_json, validate_state};
pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::path::PathSetting;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_parse_task_with_retry_and_catch() {
        let def = parse_state(
            "Charge",
            &json!({
                "Type": "Task",
                "Resource": "charge_card",
                "InputPath": "$.payment",
                "ResultPath": null,
                "Next": "Ship",
                "Retry": [{"ErrorEquals": ["ValueError"], "MaxAttempts": 2}],
                "Catch": [{"ErrorEquals": ["States.ALL"], "Next": "Refund", "ResultPath": "$.error"}]
            }),
        )
        .unwrap();

        assert_eq!(def.name, "Charge");
        assert_eq!(def.state_type(), StateType::Task);
        assert!(matches!(def.input_path, PathSetting::Path(_)));
        assert_eq!(def.result_path, PathSetting::Null);
        assert_eq!(def.output_path, PathSetting::Absent);
        assert_eq!(def.static_next(), Some("Ship"));

        let StateKind::Task(task) = &def.kind else {
            panic!("expected task");
        };
        assert_eq!(task.resource, "charge_card");
        assert_eq!(task.retry[0].max_attempts, 2);
        assert_eq!(task.retry[0].interval_seconds, 1.0);
        assert_eq!(task.retry[0].backoff_rate, 2.0);
        assert_eq!(task.catch[0].next, "Refund");
    }

    #[test]
    fn test_unknown_state_type() {
        let err = parse_state("X", &json!({"Type": "Sleep", "End": true})).unwrap_err();
        assert!(matches!(err, EngineError::UnknownStateType(t) if t == "Sleep"));
    }

    #[test]
    fn test_next_end_validation() {
        assert!(parse_state("P", &json!({"Type": "Pass"})).is_err());
        assert!(parse_state("P", &json!({"Type": "Pass", "Next": "A", "End": true})).is_err());
        assert!(parse_state("S", &json!({"Type": "Succeed"})).is_ok());
    }

    #[test]
    fn test_terminal_states_route_to_end() {
        let succeed = parse_state("Done", &json!({"Type": "Succeed"})).unwrap();
        assert!(succeed.is_terminal());
        assert_eq!(succeed.static_next(), Some(END_STATE));

        let pass = parse_state("Last", &json!({"Type": "Pass", "End": true})).unwrap();
        assert_eq!(pass.static_next(), Some(END_STATE));
    }

    #[test]
    fn test_parse_map_and_parallel() {
        let map = parse_state(
            "Each",
            &json!({
                "Type": "Map",
                "ItemsPath": "$.items",
                "MaxConcurrency": 2,
                "Iterator": {"StartAt": "Work", "States": {"Work": {"Type": "Pass", "End": true}}},
                "Parameters": {"v.$": "$$.Map.Item.Value"},
                "End": true
            }),
        )
        .unwrap();
        let StateKind::Map(m) = &map.kind else {
            panic!("expected map");
        };
        assert_eq!(m.max_concurrency, 2);
        assert_eq!(m.iterator.start_at, "Work");

        let parallel = parse_state(
            "Fork",
            &json!({
                "Type": "Parallel",
                "Branches": [{"StartAt": "A"}, {"StartAt": "B"}],
                "Next": "Join"
            }),
        )
        .unwrap();
        let StateKind::Parallel(p) = &parallel.kind else {
            panic!("expected parallel");
        };
        assert_eq!(p.branches.len(), 2);

        assert!(parse_state("Empty", &json!({"Type": "Parallel", "Branches": [], "End": true})).is_err());
    }

    #[test]
    fn test_parse_branch_linkage() {
        let def = parse_state(
            "A",
            &json!({
                "Type": "Pass",
                "End": true,
                "ParentParallelInfo": {"Name": "Fork", "BranchCounter": 2}
            }),
        )
        .unwrap();
        assert!(def.in_branch());
        assert_eq!(def.parent_parallel_info.unwrap().branch_counter, 2);

        let def = parse_state(
            "W",
            &json!({"Type": "Pass", "End": true, "ParentMapInfo": {"Name": "Each", "BranchCounter": 1}}),
        )
        .unwrap();
        assert_eq!(def.parent_map_info.unwrap().name, "Each");
    }

    #[test]
    fn test_wait_requires_one_source() {
        assert!(parse_state("W", &json!({"Type": "Wait", "Next": "X"})).is_err());
        assert!(parse_state(
            "W",
            &json!({"Type": "Wait", "Seconds": 1, "Timestamp": "2024-01-01T00:00:00Z", "Next": "X"})
        )
        .is_err());
        assert!(parse_state("W", &json!({"Type": "Wait", "SecondsPath": "$.s", "Next": "X"})).is_ok());
    }

    #[test]
    fn test_choice_compiled_on_parse() {
        let def = parse_state(
            "Route",
            &json!({
                "Type": "Choice",
                "Choices": [{"Variable": "$.count", "NumericGreaterThan": 5, "Next": "big"}],
                "Default": "small"
            }),
        )
        .unwrap();
        let StateKind::Choice(choice) = &def.kind else {
            panic!("expected choice");
        };
        assert_eq!(choice.choices[0].next, "big");
        assert_eq!(def.static_next(), None);

        assert!(parse_state(
            "Route",
            &json!({"Type": "Choice", "Choices": [{"Variable": "$.c", "Next": "x"}]})
        )
        .is_err());
    }

    #[test]
    fn test_retrier_delay() {
        let def = parse_state(
            "T",
            &json!({
                "Type": "Task",
                "Resource": "r",
                "End": true,
                "Retry": [{"ErrorEquals": ["E"], "IntervalSeconds": 1, "BackoffRate": 2}]
            }),
        )
        .unwrap();
        let StateKind::Task(task) = &def.kind else {
            panic!("expected task");
        };
        let retrier = &task.retry[0];
        assert_eq!(retrier.delay_for(1), Duration::from_secs(1));
        assert_eq!(retrier.delay_for(2), Duration::from_secs(2));
        assert_eq!(retrier.delay_for(3), Duration::from_secs(4));
    }

    #[test]
    fn test_error_matching() {
        let names = vec!["ValueError".to_string()];
        assert!(error_matches(&names, &EngineError::user_code("ValueError", "boom")));
        assert!(!error_matches(&names, &EngineError::user_code("KeyError", "boom")));

        let by_message = vec!["boom".to_string()];
        assert!(error_matches(&by_message, &EngineError::user_code("KeyError", "boom")));

        let failed = vec![STATES_TASK_FAILED.to_string()];
        assert!(error_matches(&failed, &EngineError::user_code("Anything", "x")));
        assert!(!error_matches(&failed, &EngineError::PathProcessing("x".into())));

        let all = vec![STATES_ALL.to_string()];
        assert!(error_matches(&all, &EngineError::PathProcessing("x".into())));
    }
}
