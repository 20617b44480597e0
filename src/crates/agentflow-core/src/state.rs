//! Typed run state: schema, reducers and copy-on-write updates.
//!
//! The state schema is built from the config's field declarations. Each
//! field carries a [`FieldType`], requiredness, an optional default and a
//! [`Reducer`] deciding how writes combine with the current value:
//!
//! | Reducer   | Behavior            | Use |
//! |-----------|---------------------|-----|
//! | `Replace` | Last write wins     | Plain fields, loop counters |
//! | `Append`  | Push onto a list    | Parallel collect fields |
//! | `SumInt`  | Integer accumulation| Counters that sum across writes |
//!
//! [`WorkflowState::apply`] is copy-on-write: a node's delta produces a new
//! state value and never mutates the caller's.

use crate::config::WorkflowConfig;
use crate::types::FieldType;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// A partial state update produced by a node
pub type Delta = Map<String, Value>;

/// Errors from state construction and updates
#[derive(Debug, Error, PartialEq)]
pub enum StateError {
    #[error("missing required input '{0}'")]
    MissingInput(String),

    #[error("input '{field}' has the wrong type: expected {expected}, got {got}")]
    InputType {
        field: String,
        expected: String,
        got: String,
    },

    #[error("unknown state field '{0}'")]
    UnknownField(String),

    #[error("write to '{field}' has the wrong type: expected {expected}, got {got}")]
    WriteType {
        field: String,
        expected: String,
        got: String,
    },

    #[error("reducer error on '{field}': {reason}")]
    Reducer { field: String, reason: String },

    #[error("invalid state schema: {0}")]
    Schema(String),
}

/// How repeated or concurrent writes to a field are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reducer {
    /// Replace the current value (the default)
    Replace,

    /// Append the update to the current list
    Append,

    /// Add the update to the current integer
    SumInt,
}

impl Reducer {
    /// Parse a reducer name from the config
    pub fn parse(name: &str) -> Result<Reducer, StateError> {
        match name {
            "replace" => Ok(Reducer::Replace),
            "append" => Ok(Reducer::Append),
            "sum" => Ok(Reducer::SumInt),
            other => Err(StateError::Schema(format!(
                "unknown reducer '{other}' (expected replace, append or sum)"
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Reducer::Replace => "replace",
            Reducer::Append => "append",
            Reducer::SumInt => "sum",
        }
    }

    /// Combine the current value with an update
    pub fn reduce(&self, field: &str, current: &Value, update: &Value) -> Result<Value, StateError> {
        match self {
            Reducer::Replace => Ok(update.clone()),
            Reducer::Append => match (current, update) {
                (Value::Array(items), Value::Array(more)) => {
                    let mut merged = items.clone();
                    merged.extend_from_slice(more);
                    Ok(Value::Array(merged))
                }
                (Value::Array(items), single) => {
                    let mut merged = items.clone();
                    merged.push(single.clone());
                    Ok(Value::Array(merged))
                }
                (Value::Null, Value::Array(more)) => Ok(Value::Array(more.clone())),
                (Value::Null, single) => Ok(Value::Array(vec![single.clone()])),
                _ => Err(StateError::Reducer {
                    field: field.to_string(),
                    reason: "append requires the current value to be a list".to_string(),
                }),
            },
            Reducer::SumInt => {
                let a = current.as_i64().unwrap_or(0);
                let b = update.as_i64().ok_or_else(|| StateError::Reducer {
                    field: field.to_string(),
                    reason: "sum requires an integer update".to_string(),
                })?;
                Ok(Value::from(a + b))
            }
        }
    }
}

/// Everything the engine knows about one state field
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub ty: FieldType,
    pub required: bool,
    pub default: Option<Value>,
    pub reducer: Reducer,
    pub description: Option<String>,
    /// Engine-internal fields (loop counters, branch indexes)
    pub hidden: bool,
}

/// The state schema: field specs keyed by name
#[derive(Debug, Default)]
pub struct StateSchema {
    fields: BTreeMap<String, FieldSpec>,
}

impl StateSchema {
    /// Build the schema from a loaded config.
    ///
    /// Fields with an `append` reducer default to an empty list so that
    /// collect fields exist before the first fan-in.
    pub fn from_config(config: &WorkflowConfig) -> Result<Self, StateError> {
        let mut fields = BTreeMap::new();
        for (name, field) in &config.state.fields {
            let ty = FieldType::parse(&field.field_type)
                .map_err(|e| StateError::Schema(format!("field '{name}': {e}")))?;
            let reducer = match &field.reducer {
                Some(reducer_name) => Reducer::parse(reducer_name)?,
                None => Reducer::Replace,
            };

            let default = field.default.clone().or_else(|| {
                matches!(reducer, Reducer::Append).then(|| Value::Array(Vec::new()))
            });
            if let Some(default_value) = &default {
                if !ty.accepts(default_value) {
                    return Err(StateError::Schema(format!(
                        "default for field '{name}' does not match its type {ty}"
                    )));
                }
            }

            fields.insert(
                name.clone(),
                FieldSpec {
                    ty,
                    required: field.is_required(),
                    default,
                    reducer,
                    description: field.description.clone(),
                    hidden: false,
                },
            );
        }
        Ok(Self { fields })
    }

    /// Add a hidden integer field (loop counter, branch index)
    pub fn add_hidden_counter(&mut self, name: impl Into<String>) {
        self.fields.insert(
            name.into(),
            FieldSpec {
                ty: FieldType::Int,
                required: false,
                default: Some(Value::from(0)),
                reducer: Reducer::Replace,
                description: None,
                hidden: true,
            },
        );
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.get(name)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Visible field names, sorted
    pub fn field_names(&self) -> Vec<String> {
        self.fields
            .iter()
            .filter(|(_, spec)| !spec.hidden)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Construct the initial state from run inputs.
    ///
    /// Required fields must be present with the right type; optional
    /// fields fall back to their default or null.
    pub fn make_state(self: &Arc<Self>, inputs: Map<String, Value>) -> Result<WorkflowState, StateError> {
        for key in inputs.keys() {
            if !self.fields.contains_key(key) {
                return Err(StateError::UnknownField(key.clone()));
            }
        }

        let mut values = Map::new();
        for (name, spec) in &self.fields {
            match inputs.get(name) {
                Some(value) => {
                    if !spec.ty.accepts(value) {
                        return Err(StateError::InputType {
                            field: name.clone(),
                            expected: spec.ty.to_string(),
                            got: json_type_name(value).to_string(),
                        });
                    }
                    values.insert(name.clone(), value.clone());
                }
                None if spec.required => return Err(StateError::MissingInput(name.clone())),
                None => {
                    values.insert(
                        name.clone(),
                        spec.default.clone().unwrap_or(Value::Null),
                    );
                }
            }
        }

        Ok(WorkflowState {
            schema: Arc::clone(self),
            values,
        })
    }
}

/// A run's typed state. Cloning is cheap enough for copy-on-write updates;
/// the schema is shared.
#[derive(Debug, Clone)]
pub struct WorkflowState {
    schema: Arc<StateSchema>,
    values: Map<String, Value>,
}

impl WorkflowState {
    pub fn schema(&self) -> &Arc<StateSchema> {
        &self.schema
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// All values, hidden fields included
    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }

    /// Apply a delta, producing a new state. The receiver is unchanged.
    pub fn apply(&self, delta: &Delta) -> Result<WorkflowState, StateError> {
        let mut next = self.values.clone();

        for (name, update) in delta {
            let spec = self
                .schema
                .field(name)
                .ok_or_else(|| StateError::UnknownField(name.clone()))?;

            let accepted = match spec.reducer {
                // Append accepts a full list or a single element of the list type
                Reducer::Append => match &spec.ty {
                    FieldType::List(elem) => spec.ty.accepts(update) || elem.accepts(update),
                    _ => spec.ty.accepts(update),
                },
                _ => spec.ty.accepts(update) || (!spec.required && update.is_null()),
            };
            if !accepted {
                return Err(StateError::WriteType {
                    field: name.clone(),
                    expected: spec.ty.to_string(),
                    got: json_type_name(update).to_string(),
                });
            }

            let current = next.get(name).cloned().unwrap_or(Value::Null);
            let merged = spec.reducer.reduce(name, &current, update)?;
            next.insert(name.clone(), merged);
        }

        Ok(WorkflowState {
            schema: Arc::clone(&self.schema),
            values: next,
        })
    }

    /// Fold a parallel-branch contribution into a collect field through
    /// its reducer. Skips the element type check: under the
    /// collect-errors policy the contribution may be an error placeholder
    /// object rather than a list element.
    pub fn apply_collect(&self, field: &str, contribution: Value) -> Result<WorkflowState, StateError> {
        let spec = self
            .schema
            .field(field)
            .ok_or_else(|| StateError::UnknownField(field.to_string()))?;

        let current = self.values.get(field).cloned().unwrap_or(Value::Null);
        let merged = spec.reducer.reduce(field, &current, &contribution)?;

        let mut next = self.values.clone();
        next.insert(field.to_string(), merged);
        Ok(WorkflowState {
            schema: Arc::clone(&self.schema),
            values: next,
        })
    }

    /// User-facing snapshot: all visible fields as a JSON object
    pub fn snapshot(&self) -> Value {
        let visible: Map<String, Value> = self
            .values
            .iter()
            .filter(|(name, _)| {
                self.schema
                    .field(name)
                    .map(|spec| !spec.hidden)
                    .unwrap_or(true)
            })
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        Value::Object(visible)
    }
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "int",
        Value::Number(_) => "float",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Arc<StateSchema> {
        let config = WorkflowConfig::from_yaml(
            r#"
schema_version: "1.0"
flow:
  name: test
state:
  fields:
    topic:
      type: str
    article:
      type: str
      default: ""
    count:
      type: int
      default: 0
      reducer: sum
    pages:
      type: list[str]
      reducer: append
      required: false
nodes:
  - id: n
    prompt: "{topic}"
    outputs: [article]
edges:
  - from: __start__
    to: n
  - from: n
    to: __end__
"#,
        )
        .unwrap();
        Arc::new(StateSchema::from_config(&config).unwrap())
    }

    fn inputs(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_make_state_fills_defaults() {
        let state = schema()
            .make_state(inputs(&[("topic", json!("dogs"))]))
            .unwrap();
        assert_eq!(state.get("topic"), Some(&json!("dogs")));
        assert_eq!(state.get("article"), Some(&json!("")));
        assert_eq!(state.get("count"), Some(&json!(0)));
        // Append fields default to an empty list
        assert_eq!(state.get("pages"), Some(&json!([])));
    }

    #[test]
    fn test_make_state_missing_required() {
        assert_eq!(
            schema().make_state(inputs(&[])).unwrap_err(),
            StateError::MissingInput("topic".to_string())
        );
    }

    #[test]
    fn test_make_state_wrong_type() {
        let err = schema()
            .make_state(inputs(&[("topic", json!(42))]))
            .unwrap_err();
        assert!(matches!(err, StateError::InputType { .. }));
    }

    #[test]
    fn test_make_state_unknown_input() {
        let err = schema()
            .make_state(inputs(&[("topic", json!("t")), ("bogus", json!(1))]))
            .unwrap_err();
        assert_eq!(err, StateError::UnknownField("bogus".to_string()));
    }

    #[test]
    fn test_apply_is_copy_on_write() {
        let state = schema()
            .make_state(inputs(&[("topic", json!("dogs"))]))
            .unwrap();

        let mut delta = Delta::new();
        delta.insert("article".to_string(), json!("A1"));
        let updated = state.apply(&delta).unwrap();

        // The original is untouched
        assert_eq!(state.get("article"), Some(&json!("")));
        assert_eq!(updated.get("article"), Some(&json!("A1")));
    }

    #[test]
    fn test_sum_reducer_accumulates() {
        let state = schema()
            .make_state(inputs(&[("topic", json!("t"))]))
            .unwrap();

        let mut delta = Delta::new();
        delta.insert("count".to_string(), json!(2));
        let state = state.apply(&delta).unwrap();
        let state = state.apply(&delta).unwrap();
        assert_eq!(state.get("count"), Some(&json!(4)));
    }

    #[test]
    fn test_append_reducer_single_and_list() {
        let state = schema()
            .make_state(inputs(&[("topic", json!("t"))]))
            .unwrap();

        let mut delta = Delta::new();
        delta.insert("pages".to_string(), json!("P_a"));
        let state = state.apply(&delta).unwrap();

        let mut delta = Delta::new();
        delta.insert("pages".to_string(), json!(["P_b", "P_c"]));
        let state = state.apply(&delta).unwrap();

        assert_eq!(state.get("pages"), Some(&json!(["P_a", "P_b", "P_c"])));
    }

    #[test]
    fn test_apply_rejects_unknown_field() {
        let state = schema()
            .make_state(inputs(&[("topic", json!("t"))]))
            .unwrap();
        let mut delta = Delta::new();
        delta.insert("nope".to_string(), json!(1));
        assert_eq!(
            state.apply(&delta).unwrap_err(),
            StateError::UnknownField("nope".to_string())
        );
    }

    #[test]
    fn test_apply_rejects_wrong_type() {
        let state = schema()
            .make_state(inputs(&[("topic", json!("t"))]))
            .unwrap();
        let mut delta = Delta::new();
        delta.insert("article".to_string(), json!(5));
        assert!(matches!(
            state.apply(&delta).unwrap_err(),
            StateError::WriteType { .. }
        ));
    }

    #[test]
    fn test_hidden_fields_excluded_from_snapshot() {
        let config = WorkflowConfig::from_yaml(
            r#"
schema_version: "1.0"
flow:
  name: test
state:
  fields:
    x:
      type: int
      default: 0
nodes:
  - id: n
    prompt: "p"
    outputs: [x]
edges:
  - from: __start__
    to: n
  - from: n
    to: __end__
"#,
        )
        .unwrap();
        let mut schema = StateSchema::from_config(&config).unwrap();
        schema.add_hidden_counter("__iter_n");
        let schema = Arc::new(schema);

        let state = schema.make_state(Map::new()).unwrap();
        let snapshot = state.snapshot();
        assert!(snapshot.get("x").is_some());
        assert!(snapshot.get("__iter_n").is_none());
        // But the value is present internally
        assert_eq!(state.get("__iter_n"), Some(&json!(0)));
    }

    #[test]
    fn test_reducer_parse() {
        assert_eq!(Reducer::parse("append").unwrap(), Reducer::Append);
        assert_eq!(Reducer::parse("replace").unwrap(), Reducer::Replace);
        assert_eq!(Reducer::parse("sum").unwrap(), Reducer::SumInt);
        assert!(Reducer::parse("max").is_err());
    }
}
