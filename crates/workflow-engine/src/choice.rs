//! Choice rule compilation and evaluation.
//!
//! Rules are compiled once into a tree of And/Or/Not/comparison nodes and
//! evaluated by walking the tree against the state input.

use chrono::{DateTime, FixedOffset};
use serde::Deserialize;
use serde_json::Value;
use std::cmp::Ordering;

use crate::error::{EngineError, EngineResult};
use crate::path::JsonPath;

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equals,
    LessThan,
    GreaterThan,
    LessThanEquals,
    GreaterThanEquals,
}

impl Operator {
    fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "Equals" => Some(Operator::Equals),
            "LessThan" => Some(Operator::LessThan),
            "GreaterThan" => Some(Operator::GreaterThan),
            "LessThanEquals" => Some(Operator::LessThanEquals),
            "GreaterThanEquals" => Some(Operator::GreaterThanEquals),
            _ => None,
        }
    }

    fn holds(&self, ordering: Ordering) -> bool {
        match self {
            Operator::Equals => ordering == Ordering::Equal,
            Operator::LessThan => ordering == Ordering::Less,
            Operator::GreaterThan => ordering == Ordering::Greater,
            Operator::LessThanEquals => ordering != Ordering::Greater,
            Operator::GreaterThanEquals => ordering != Ordering::Less,
        }
    }
}

/// Typed literal a variable is compared against.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    String(String),
    Numeric(f64),
    Boolean(bool),
    Timestamp(DateTime<FixedOffset>),
}

/// A compiled choice rule.
#[derive(Debug, Clone, PartialEq)]
pub enum ChoiceRule {
    And(Vec<ChoiceRule>),
    Or(Vec<ChoiceRule>),
    Not(Box<ChoiceRule>),
    Compare {
        variable: JsonPath,
        operator: Operator,
        literal: Literal,
    },
}

const COMPARATOR_FAMILIES: [&str; 4] = ["String", "Numeric", "Boolean", "Timestamp"];

impl ChoiceRule {
    /// Compile a rule object (the `Next` key, if any, is ignored).
    pub fn compile(rule: &Value) -> EngineResult<Self> {
        let fields = rule.as_object().ok_or_else(|| {
            EngineError::InvalidDefinition(format!("choice rule must be an object: {}", rule))
        })?;

        if let Some(children) = fields.get("And") {
            return Ok(ChoiceRule::And(compile_list("And", children)?));
        }
        if let Some(children) = fields.get("Or") {
            return Ok(ChoiceRule::Or(compile_list("Or", children)?));
        }
        if let Some(child) = fields.get("Not") {
            return Ok(ChoiceRule::Not(Box::new(ChoiceRule::compile(child)?)));
        }

        let variable = fields
            .get("Variable")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                EngineError::InvalidDefinition(format!("choice rule has no Variable: {}", rule))
            })?;
        let variable = JsonPath::parse(variable)?;

        for (key, value) in fields {
            let Some(family) = COMPARATOR_FAMILIES.iter().find(|f| key.starts_with(*f)) else {
                continue;
            };
            let operator = Operator::from_suffix(&key[family.len()..]).ok_or_else(|| {
                EngineError::InvalidDefinition(format!("unknown comparison operator: {}", key))
            })?;
            let literal = parse_literal(family, operator, key, value)?;
            return Ok(ChoiceRule::Compare {
                variable,
                operator,
                literal,
            });
        }

        Err(EngineError::InvalidDefinition(format!(
            "choice rule has no comparison operator: {}",
            rule
        )))
    }

    /// Evaluate the rule against the state input.
    ///
    /// A missing variable or a value of the wrong type compares as false.
    pub fn evaluate(&self, input: &Value) -> bool {
        match self {
            ChoiceRule::And(rules) => rules.iter().all(|r| r.evaluate(input)),
            ChoiceRule::Or(rules) => rules.iter().any(|r| r.evaluate(input)),
            ChoiceRule::Not(rule) => !rule.evaluate(input),
            ChoiceRule::Compare {
                variable,
                operator,
                literal,
            } => match variable.select(input) {
                Some(value) => compare(value, *operator, literal),
                None => false,
            },
        }
    }
}

fn compile_list(name: &str, children: &Value) -> EngineResult<Vec<ChoiceRule>> {
    let children = children.as_array().ok_or_else(|| {
        EngineError::InvalidDefinition(format!("{} expects an array of rules", name))
    })?;
    children.iter().map(ChoiceRule::compile).collect()
}

fn parse_literal(family: &str, operator: Operator, key: &str, value: &Value) -> EngineResult<Literal> {
    let mismatch = || EngineError::InvalidDefinition(format!("{} has an invalid operand: {}", key, value));

    match family {
        "String" => value
            .as_str()
            .map(|s| Literal::String(s.to_string()))
            .ok_or_else(mismatch),
        "Numeric" => value.as_f64().map(Literal::Numeric).ok_or_else(mismatch),
        "Boolean" => {
            if operator != Operator::Equals {
                return Err(EngineError::InvalidDefinition(format!(
                    "unknown comparison operator: {}",
                    key
                )));
            }
            value.as_bool().map(Literal::Boolean).ok_or_else(mismatch)
        }
        _ => value
            .as_str()
            .and_then(parse_timestamp)
            .map(Literal::Timestamp)
            .ok_or_else(mismatch),
    }
}

/// Parse an RFC 3339 timestamp.
pub fn parse_timestamp(text: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(text).ok()
}

fn compare(value: &Value, operator: Operator, literal: &Literal) -> bool {
    let ordering = match literal {
        Literal::String(expected) => value.as_str().map(|actual| actual.cmp(expected.as_str())),
        Literal::Numeric(expected) => value
            .as_f64()
            .and_then(|actual| actual.partial_cmp(expected)),
        Literal::Boolean(expected) => value
            .as_bool()
            .map(|actual| if actual == *expected { Ordering::Equal } else { Ordering::Less }),
        Literal::Timestamp(expected) => value
            .as_str()
            .and_then(parse_timestamp)
            .map(|actual| actual.cmp(expected)),
    };

    ordering.map(|o| operator.holds(o)).unwrap_or(false)
}

/// A top-level choice: a rule plus the state it selects.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "Value")]
pub struct ChoiceBranch {
    pub rule: ChoiceRule,
    pub next: String,
}

impl TryFrom<Value> for ChoiceBranch {
    type Error = EngineError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let next = value
            .get("Next")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                EngineError::InvalidDefinition(format!("choice has no Next: {}", value))
            })?
            .to_string();
        let rule = ChoiceRule::compile(&value)?;
        Ok(Self { rule, next })
    }
}

/// Select the next state: first matching choice, then Default.
pub fn select_next<'a>(
    choices: &'a [ChoiceBranch],
    default: Option<&'a str>,
    input: &Value,
) -> Option<&'a str> {
    choices
        .iter()
        .find(|choice| choice.rule.evaluate(input))
        .map(|choice| choice.next.as_str())
        .or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn branch(rule: Value) -> ChoiceBranch {
        ChoiceBranch::try_from(rule).unwrap()
    }

    #[test]
    fn test_numeric_choice_with_default() {
        let choices = vec![branch(
            json!({"Variable": "$.count", "NumericGreaterThan": 5, "Next": "big"}),
        )];

        assert_eq!(select_next(&choices, Some("small"), &json!({"count": 10})), Some("big"));
        assert_eq!(select_next(&choices, Some("small"), &json!({"count": 3})), Some("small"));
        assert_eq!(select_next(&choices, None, &json!({"count": 3})), None);
    }

    #[test]
    fn test_first_match_wins() {
        let choices = vec![
            branch(json!({"Variable": "$.n", "NumericGreaterThanEquals": 1, "Next": "first"})),
            branch(json!({"Variable": "$.n", "NumericGreaterThanEquals": 0, "Next": "second"})),
        ];
        assert_eq!(select_next(&choices, None, &json!({"n": 1})), Some("first"));
        assert_eq!(select_next(&choices, None, &json!({"n": 0})), Some("second"));
    }

    #[test]
    fn test_boolean_logic() {
        let rule = ChoiceRule::compile(&json!({
            "And": [
                {"Variable": "$.kind", "StringEquals": "order"},
                {"Or": [
                    {"Variable": "$.paid", "BooleanEquals": true},
                    {"Not": {"Variable": "$.total", "NumericLessThanEquals": 100}}
                ]}
            ]
        }))
        .unwrap();

        assert!(rule.evaluate(&json!({"kind": "order", "paid": true, "total": 5})));
        assert!(rule.evaluate(&json!({"kind": "order", "paid": false, "total": 500})));
        assert!(!rule.evaluate(&json!({"kind": "order", "paid": false, "total": 50})));
        assert!(!rule.evaluate(&json!({"kind": "refund", "paid": true, "total": 5})));
    }

    #[test]
    fn test_string_and_timestamp_ordering() {
        let before = ChoiceRule::compile(&json!({
            "Variable": "$.at", "TimestampLessThan": "2024-01-01T00:00:00Z"
        }))
        .unwrap();
        assert!(before.evaluate(&json!({"at": "2023-12-31T23:59:59Z"})));
        assert!(!before.evaluate(&json!({"at": "2024-01-01T00:00:00+00:00"})));
        assert!(!before.evaluate(&json!({"at": "not a time"})));

        let name = ChoiceRule::compile(&json!({"Variable": "$.s", "StringGreaterThan": "b"})).unwrap();
        assert!(name.evaluate(&json!({"s": "c"})));
        assert!(!name.evaluate(&json!({"s": "a"})));
    }

    #[test]
    fn test_missing_or_mistyped_variable_is_false() {
        let rule = ChoiceRule::compile(&json!({"Variable": "$.count", "NumericEquals": 1})).unwrap();
        assert!(!rule.evaluate(&json!({})));
        assert!(!rule.evaluate(&json!({"count": "1"})));
    }

    #[test]
    fn test_compile_errors() {
        assert!(ChoiceRule::compile(&json!({"Variable": "$.a"})).is_err());
        assert!(ChoiceRule::compile(&json!({"Variable": "$.a", "NumericAround": 1})).is_err());
        assert!(ChoiceRule::compile(&json!({"Variable": "$.a", "BooleanLessThan": true})).is_err());
        assert!(ChoiceRule::compile(&json!({"Variable": "$.a", "NumericEquals": "x"})).is_err());
        assert!(ChoiceBranch::try_from(json!({"Variable": "$.a", "NumericEquals": 1})).is_err());
    }
}
