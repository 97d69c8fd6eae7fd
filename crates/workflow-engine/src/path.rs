//! JSONPath subset used by state input and output processing.
//!
//! Supported grammar: a `$` (state data) or `$$` (context object) root
//! followed by any number of `.field`, `['field']` and `[index]` segments.

use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::{EngineError, EngineResult};

/// One step of a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Object member access.
    Field(String),
    /// Array element access.
    Index(usize),
}

/// Which value a path is evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathRoot {
    /// `$`: the state data.
    Input,
    /// `$$`: the context object (Map item value and index).
    Context,
}

/// A parsed path expression.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct JsonPath {
    root: PathRoot,
    segments: Vec<Segment>,
    raw: String,
}

impl JsonPath {
    /// Parse a path expression.
    pub fn parse(expr: &str) -> EngineResult<Self> {
        let invalid = |reason: &str| {
            EngineError::PathProcessing(format!("invalid path '{}': {}", expr, reason))
        };

        let (root, rest) = if let Some(rest) = expr.strip_prefix("$$") {
            (PathRoot::Context, rest)
        } else if let Some(rest) = expr.strip_prefix('$') {
            (PathRoot::Input, rest)
        } else {
            return Err(invalid("must start with '$'"));
        };

        let chars: Vec<char> = rest.chars().collect();
        let mut segments = Vec::new();
        let mut i = 0;

        while i < chars.len() {
            match chars[i] {
                '.' => {
                    i += 1;
                    let start = i;
                    while i < chars.len() && chars[i] != '.' && chars[i] != '[' {
                        i += 1;
                    }
                    if start == i {
                        return Err(invalid("empty field name"));
                    }
                    segments.push(Segment::Field(chars[start..i].iter().collect()));
                }
                '[' => {
                    i += 1;
                    if i < chars.len() && (chars[i] == '\'' || chars[i] == '"') {
                        let quote = chars[i];
                        i += 1;
                        let start = i;
                        while i < chars.len() && chars[i] != quote {
                            i += 1;
                        }
                        if i >= chars.len() {
                            return Err(invalid("unterminated quoted field"));
                        }
                        let name: String = chars[start..i].iter().collect();
                        i += 1;
                        if i >= chars.len() || chars[i] != ']' {
                            return Err(invalid("expected ']'"));
                        }
                        i += 1;
                        segments.push(Segment::Field(name));
                    } else {
                        let start = i;
                        while i < chars.len() && chars[i] != ']' {
                            i += 1;
                        }
                        if i >= chars.len() {
                            return Err(invalid("expected ']'"));
                        }
                        let digits: String = chars[start..i].iter().collect();
                        let index = digits
                            .trim()
                            .parse::<usize>()
                            .map_err(|_| invalid("array index must be a non-negative integer"))?;
                        i += 1;
                        segments.push(Segment::Index(index));
                    }
                }
                other => {
                    return Err(invalid(&format!("unexpected character '{}'", other)));
                }
            }
        }

        Ok(Self {
            root,
            segments,
            raw: expr.to_string(),
        })
    }

    /// True for the bare `$` path.
    pub fn is_root(&self) -> bool {
        self.root == PathRoot::Input && self.segments.is_empty()
    }

    /// Root this path is evaluated against.
    pub fn root(&self) -> PathRoot {
        self.root
    }

    /// Path segments after the root.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Select a value by walking the segments, ignoring the root kind.
    pub fn select<'a>(&self, value: &'a Value) -> Option<&'a Value> {
        let mut current = value;
        for segment in &self.segments {
            current = match segment {
                Segment::Field(name) => current.as_object()?.get(name)?,
                Segment::Index(index) => current.as_array()?.get(*index)?,
            };
        }
        Some(current)
    }

    /// Resolve the path to an owned value, failing when nothing matches.
    pub fn resolve(&self, input: &Value, context: Option<&Value>) -> EngineResult<Value> {
        let base = match self.root {
            PathRoot::Input => input,
            PathRoot::Context => context.ok_or_else(|| {
                EngineError::PathProcessing(format!(
                    "context object is not available for '{}'",
                    self.raw
                ))
            })?,
        };

        self.select(base).cloned().ok_or_else(|| {
            EngineError::PathProcessing(format!("path '{}' matched no data", self.raw))
        })
    }

    /// Write `value` into `target` at this path, creating missing objects.
    pub fn assign(&self, target: &mut Value, value: Value) -> EngineResult<()> {
        if self.root == PathRoot::Context {
            return Err(EngineError::PathProcessing(format!(
                "cannot write to context path '{}'",
                self.raw
            )));
        }

        if self.segments.is_empty() {
            *target = value;
            return Ok(());
        }

        let mut value = Some(value);
        let last = self.segments.len() - 1;
        let mut current = target;

        for (pos, segment) in self.segments.iter().enumerate() {
            current = match segment {
                Segment::Field(name) => {
                    if current.is_null() {
                        *current = Value::Object(Map::new());
                    }
                    let object = current.as_object_mut().ok_or_else(|| {
                        EngineError::PathProcessing(format!(
                            "cannot set '{}': '{}' is not an object",
                            self.raw, name
                        ))
                    })?;
                    if pos == last {
                        object.insert(name.clone(), value.take().unwrap_or(Value::Null));
                        return Ok(());
                    }
                    object.entry(name.clone()).or_insert(Value::Null)
                }
                Segment::Index(index) => {
                    let slot = current
                        .as_array_mut()
                        .and_then(|array| array.get_mut(*index))
                        .ok_or_else(|| {
                            EngineError::PathProcessing(format!(
                                "cannot set '{}': index {} out of range",
                                self.raw, index
                            ))
                        })?;
                    if pos == last {
                        *slot = value.take().unwrap_or(Value::Null);
                        return Ok(());
                    }
                    slot
                }
            };
        }

        Ok(())
    }
}

impl FromStr for JsonPath {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for JsonPath {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl fmt::Display for JsonPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

/// A path field of a state definition.
///
/// Absent and explicit `null` behave differently, so they are kept apart.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PathSetting {
    /// Field not present.
    #[default]
    Absent,
    /// Field present with `null`.
    Null,
    /// Field present with a path expression.
    Path(JsonPath),
}

/// Serde helper for `PathSetting` fields (use with `#[serde(default)]`).
pub fn deserialize_path_setting<'de, D>(deserializer: D) -> Result<PathSetting, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        None => Ok(PathSetting::Null),
        Some(expr) => JsonPath::parse(&expr)
            .map(PathSetting::Path)
            .map_err(serde::de::Error::custom),
    }
}

/// Apply InputPath.
pub fn apply_input_path(setting: &PathSetting, input: Value) -> EngineResult<Value> {
    select_or(setting, input, || Value::Object(Map::new()))
}

/// Apply ItemsPath.
pub fn apply_items_path(setting: &PathSetting, input: Value) -> EngineResult<Value> {
    select_or(setting, input, || Value::Array(Vec::new()))
}

/// Apply OutputPath.
pub fn apply_output_path(setting: &PathSetting, value: Value) -> EngineResult<Value> {
    select_or(setting, value, || Value::Object(Map::new()))
}

fn select_or(
    setting: &PathSetting,
    value: Value,
    empty: impl FnOnce() -> Value,
) -> EngineResult<Value> {
    match setting {
        PathSetting::Absent => Ok(value),
        PathSetting::Null => Ok(empty()),
        PathSetting::Path(path) if path.is_root() => Ok(value),
        PathSetting::Path(path) => path.resolve(&value, None),
    }
}

/// Combine a state's input and its output according to ResultPath.
///
/// Absent or `null` keeps only the output, `$` keeps only the input, and any
/// other path merges the output into a copy of the input at that path.
pub fn apply_result_path(setting: &PathSetting, input: &Value, output: Value) -> EngineResult<Value> {
    match setting {
        PathSetting::Absent | PathSetting::Null => Ok(output),
        PathSetting::Path(path) if path.is_root() => Ok(input.clone()),
        PathSetting::Path(path) => {
            let mut merged = input.clone();
            path.assign(&mut merged, output)?;
            Ok(merged)
        }
    }
}

/// Build the context object a Map branch sees under `$$`.
pub fn map_item_context(item: &Value, index: usize) -> Value {
    serde_json::json!({
        "Map": {
            "Item": {
                "Value": item,
                "Index": index,
            }
        }
    })
}

/// Render a Parameters template.
///
/// Keys ending in `.$` are replaced by the value their path selects; the
/// suffix is dropped from the key.
pub fn render_parameters(
    template: &Value,
    input: &Value,
    context: Option<&Value>,
) -> EngineResult<Value> {
    match template {
        Value::Object(fields) => {
            let mut rendered = Map::with_capacity(fields.len());
            for (key, value) in fields {
                match key.strip_suffix(".$") {
                    Some(name) => {
                        let expr = value.as_str().ok_or_else(|| {
                            EngineError::PathProcessing(format!(
                                "parameter '{}' must be a path string",
                                key
                            ))
                        })?;
                        let path = JsonPath::parse(expr)?;
                        rendered.insert(name.to_string(), path.resolve(input, context)?);
                    }
                    None => {
                        rendered.insert(key.clone(), render_parameters(value, input, context)?);
                    }
                }
            }
            Ok(Value::Object(rendered))
        }
        Value::Array(items) => items
            .iter()
            .map(|item| render_parameters(item, input, context))
            .collect::<EngineResult<Vec<_>>>()
            .map(Value::Array),
        other => Ok(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(expr: &str) -> PathSetting {
        PathSetting::Path(JsonPath::parse(expr).unwrap())
    }

    #[test]
    fn test_parse_segments() {
        let p = JsonPath::parse("$.orders[2].line['unit price']").unwrap();
        assert_eq!(p.root(), PathRoot::Input);
        assert_eq!(
            p.segments(),
            &[
                Segment::Field("orders".to_string()),
                Segment::Index(2),
                Segment::Field("line".to_string()),
                Segment::Field("unit price".to_string()),
            ]
        );

        let ctx = JsonPath::parse("$$.Map.Item.Value").unwrap();
        assert_eq!(ctx.root(), PathRoot::Context);
        assert!(JsonPath::parse("$").unwrap().is_root());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(JsonPath::parse("orders").is_err());
        assert!(JsonPath::parse("$.").is_err());
        assert!(JsonPath::parse("$[x]").is_err());
        assert!(JsonPath::parse("$['open").is_err());
        assert!(JsonPath::parse("$a").is_err());
    }

    #[test]
    fn test_input_then_output_root_is_identity() {
        let values = vec![
            json!(null),
            json!(42),
            json!("text"),
            json!([1, {"a": [true, null]}]),
            json!({"nested": {"deep": [1.5, "x"]}}),
        ];
        let root = path("$");
        for value in values {
            let selected = apply_input_path(&root, value.clone()).unwrap();
            let out = apply_output_path(&root, selected).unwrap();
            assert_eq!(out, value);
        }
    }

    #[test]
    fn test_null_paths_yield_empty() {
        let input = json!({"a": 1});
        assert_eq!(apply_input_path(&PathSetting::Null, input.clone()).unwrap(), json!({}));
        assert_eq!(apply_items_path(&PathSetting::Null, input.clone()).unwrap(), json!([]));
        assert_eq!(apply_output_path(&PathSetting::Null, input).unwrap(), json!({}));
    }

    #[test]
    fn test_missing_path_is_error() {
        let err = apply_input_path(&path("$.missing"), json!({"a": 1})).unwrap_err();
        assert!(matches!(err, EngineError::PathProcessing(_)));
    }

    #[test]
    fn test_result_path_modes() {
        let input = json!({"keep": true});
        let output = json!({"x": 1});

        assert_eq!(
            apply_result_path(&path("$"), &input, output.clone()).unwrap(),
            input
        );
        assert_eq!(
            apply_result_path(&PathSetting::Null, &input, output.clone()).unwrap(),
            output
        );
        assert_eq!(
            apply_result_path(&PathSetting::Absent, &input, output.clone()).unwrap(),
            output
        );
        assert_eq!(
            apply_result_path(&path("$.result.inner"), &input, output).unwrap(),
            json!({"keep": true, "result": {"inner": {"x": 1}}})
        );
    }

    #[test]
    fn test_result_path_into_scalar_fails() {
        let err = apply_result_path(&path("$.a.b"), &json!({"a": 3}), json!(1)).unwrap_err();
        assert!(matches!(err, EngineError::PathProcessing(_)));
    }

    #[test]
    fn test_result_path_array_index() {
        let merged =
            apply_result_path(&path("$.list[1]"), &json!({"list": [0, 0]}), json!("x")).unwrap();
        assert_eq!(merged, json!({"list": [0, "x"]}));

        assert!(apply_result_path(&path("$.list[5]"), &json!({"list": []}), json!(1)).is_err());
    }

    #[test]
    fn test_render_parameters() {
        let template = json!({
            "static": "value",
            "id.$": "$.order.id",
            "nested": {"first.$": "$.items[0]"},
            "list": [{"n.$": "$.order.id"}]
        });
        let input = json!({"order": {"id": 7}, "items": ["a", "b"]});

        let rendered = render_parameters(&template, &input, None).unwrap();
        assert_eq!(
            rendered,
            json!({
                "static": "value",
                "id": 7,
                "nested": {"first": "a"},
                "list": [{"n": 7}]
            })
        );
    }

    #[test]
    fn test_render_parameters_map_context() {
        let template = json!({"item.$": "$$.Map.Item.Value", "idx.$": "$$.Map.Item.Index", "all.$": "$"});
        let item = json!({"sku": "x"});
        let context = map_item_context(&item, 3);

        let rendered = render_parameters(&template, &json!({"n": 1}), Some(&context)).unwrap();
        assert_eq!(rendered, json!({"item": {"sku": "x"}, "idx": 3, "all": {"n": 1}}));
    }

    #[test]
    fn test_render_parameters_requires_context() {
        let template = json!({"item.$": "$$.Map.Item.Value"});
        assert!(render_parameters(&template, &json!({}), None).is_err());
    }

    #[test]
    fn test_path_setting_deserialize() {
        #[derive(Deserialize)]
        struct Holder {
            #[serde(default, deserialize_with = "deserialize_path_setting")]
            p: PathSetting,
        }

        let absent: Holder = serde_json::from_value(json!({})).unwrap();
        assert_eq!(absent.p, PathSetting::Absent);

        let null: Holder = serde_json::from_value(json!({"p": null})).unwrap();
        assert_eq!(null.p, PathSetting::Null);

        let set: Holder = serde_json::from_value(json!({"p": "$.a"})).unwrap();
        assert!(matches!(set.p, PathSetting::Path(_)));

        assert!(serde_json::from_value::<Holder>(json!({"p": "bad"})).is_err());
    }
}
