//! Per-node output models: the shape the LLM's structured response must
//! take, and the validator that turns a raw response into a state delta.
//!
//! A node without an `output_schema` gets the default scalar schema
//! (`str`); scalar schemas are wrapped in an object so the model always
//! returns one. Object schemas validate field by field, rejecting unknown
//! and missing fields by name. Nested objects inside an output schema are
//! not supported and are rejected when the model is built.

use crate::config::{NodeConfig, OutputSchemaConfig};
use crate::state::{json_type_name, Delta};
use crate::types::FieldType;
use serde_json::{json, Value};
use thiserror::Error;

/// Errors from building an output model or validating a response
#[derive(Debug, Error, PartialEq)]
pub enum OutputError {
    #[error("node '{node}': {reason}")]
    BadSchema { node: String, reason: String },

    #[error("nested objects are not supported in output schemas (field '{field}')")]
    NestedObject { field: String },

    #[error("response is not a JSON object (got {0})")]
    NotAnObject(String),

    #[error("response is missing field '{0}'")]
    MissingField(String),

    #[error("response contains unknown field '{0}'")]
    UnknownField(String),

    #[error("response field '{field}' has the wrong type: expected {expected}, got {got}")]
    FieldType {
        field: String,
        expected: String,
        got: String,
    },
}

#[derive(Debug, Clone)]
struct OutputField {
    name: String,
    ty: FieldType,
    description: Option<String>,
}

/// Validator for one node's structured LLM response
#[derive(Debug, Clone)]
pub struct OutputModel {
    node_id: String,
    fields: Vec<OutputField>,
    /// Scalar schemas accept `{result: ...}` as an alias for the field name
    scalar: bool,
}

impl OutputModel {
    /// Build the model for a node.
    ///
    /// Scalar schemas (and the default) require exactly one output; object
    /// schemas take their field names from the schema itself.
    pub fn for_node(node: &NodeConfig) -> Result<OutputModel, OutputError> {
        let bad = |reason: String| OutputError::BadSchema {
            node: node.id.clone(),
            reason,
        };

        match &node.output_schema {
            None => {
                let name = single_output(node).map_err(bad)?;
                Ok(OutputModel {
                    node_id: node.id.clone(),
                    fields: vec![OutputField {
                        name,
                        ty: FieldType::Str,
                        description: None,
                    }],
                    scalar: true,
                })
            }
            Some(OutputSchemaConfig::Scalar(type_str)) => {
                let ty = FieldType::parse(type_str).map_err(|e| bad(e.to_string()))?;
                if matches!(ty, FieldType::Object(_)) {
                    return Err(bad(
                        "use the field-map form for object output schemas".to_string(),
                    ));
                }
                let name = single_output(node).map_err(bad)?;
                Ok(OutputModel {
                    node_id: node.id.clone(),
                    fields: vec![OutputField {
                        name,
                        ty,
                        description: None,
                    }],
                    scalar: true,
                })
            }
            Some(OutputSchemaConfig::Object(schema_fields)) => {
                let mut fields = Vec::new();
                for (name, field) in schema_fields {
                    let ty = FieldType::parse(field.type_str())
                        .map_err(|e| bad(format!("field '{name}': {e}")))?;
                    if matches!(ty, FieldType::Object(_)) {
                        return Err(OutputError::NestedObject {
                            field: name.clone(),
                        });
                    }
                    fields.push(OutputField {
                        name: name.clone(),
                        ty,
                        description: field.description().map(str::to_string),
                    });
                }
                Ok(OutputModel {
                    node_id: node.id.clone(),
                    fields,
                    scalar: false,
                })
            }
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Field names the response must carry
    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    /// The declared type of a response field
    pub fn field_type(&self, name: &str) -> Option<&FieldType> {
        self.fields.iter().find(|f| f.name == name).map(|f| &f.ty)
    }

    /// Provider-facing JSON schema, descriptions included
    pub fn json_schema(&self) -> Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for field in &self.fields {
            let mut schema = field.ty.json_schema();
            if let Some(description) = &field.description {
                schema["description"] = json!(description);
            }
            properties.insert(field.name.clone(), schema);
            required.push(json!(field.name));
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false,
        })
    }

    /// Validate a raw response into a delta keyed by the node's outputs
    pub fn parse(&self, raw: &Value) -> Result<Delta, OutputError> {
        let object = match raw {
            Value::Object(entries) => entries.clone(),
            // A bare scalar answers a scalar schema
            other if self.scalar => {
                let mut wrapped = serde_json::Map::new();
                wrapped.insert(self.fields[0].name.clone(), other.clone());
                wrapped
            }
            other => return Err(OutputError::NotAnObject(json_type_name(other).to_string())),
        };

        let mut object = object;
        // Scalar responses may come back under the conventional `result` key
        if self.scalar && !object.contains_key(&self.fields[0].name) {
            if let Some(value) = object.remove("result") {
                object.insert(self.fields[0].name.clone(), value);
            }
        }

        for key in object.keys() {
            if !self.fields.iter().any(|f| &f.name == key) {
                return Err(OutputError::UnknownField(key.clone()));
            }
        }

        let mut delta = Delta::new();
        for field in &self.fields {
            let value = object
                .get(&field.name)
                .ok_or_else(|| OutputError::MissingField(field.name.clone()))?;
            if !field.ty.accepts(value) {
                return Err(OutputError::FieldType {
                    field: field.name.clone(),
                    expected: field.ty.to_string(),
                    got: json_type_name(value).to_string(),
                });
            }
            delta.insert(field.name.clone(), value.clone());
        }
        Ok(delta)
    }
}

fn single_output(node: &NodeConfig) -> Result<String, String> {
    match node.outputs.as_slice() {
        [only] => Ok(only.clone()),
        outputs => Err(format!(
            "a scalar output schema requires exactly one output, found {}",
            outputs.len()
        )),
    }
}
