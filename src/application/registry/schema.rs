//! Compiles a JSON-Schema-like tool parameter description into a runtime
//! validator.
//!
//! Unknown or union schema shapes compile to an accept-anything validator
//! instead of failing closed: tools discovered from third-party servers must
//! not be silently excluded because their schema dialect is not handled here.
//! Objects are permissive about extra properties unless the schema says
//! `additionalProperties: false`. Execution correctness ultimately rests with
//! the tool body, not this gate.

use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("parameter validation failed at {path}: {message}")]
pub struct SchemaViolation {
    pub path: String,
    pub message: String,
}

impl SchemaViolation {
    fn new(path: &str, message: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum CompiledSchema {
    Any,
    Boolean,
    Integer,
    Number,
    String {
        allowed: Option<Vec<String>>,
    },
    Array {
        items: Option<Box<CompiledSchema>>,
    },
    Object {
        properties: HashMap<String, CompiledSchema>,
        required: Vec<String>,
        additional_allowed: bool,
    },
}

impl CompiledSchema {
    pub fn compile(schema: &Value) -> Self {
        let Some(map) = schema.as_object() else {
            return CompiledSchema::Any;
        };

        match map.get("type").and_then(Value::as_str) {
            Some("boolean") => CompiledSchema::Boolean,
            Some("integer") => CompiledSchema::Integer,
            Some("number") => CompiledSchema::Number,
            Some("string") => {
                let allowed = map.get("enum").and_then(Value::as_array).map(|values| {
                    values
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                });
                CompiledSchema::String { allowed }
            }
            Some("array") => {
                let items = map
                    .get("items")
                    .map(|items| Box::new(CompiledSchema::compile(items)));
                CompiledSchema::Array { items }
            }
            Some("object") => {
                let properties = map
                    .get("properties")
                    .and_then(Value::as_object)
                    .map(|props| {
                        props
                            .iter()
                            .map(|(key, value)| (key.clone(), CompiledSchema::compile(value)))
                            .collect()
                    })
                    .unwrap_or_default();
                let required = map
                    .get("required")
                    .and_then(Value::as_array)
                    .map(|values| {
                        values
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                // Permissive default: only an explicit `false` closes the object.
                let additional_allowed = map
                    .get("additionalProperties")
                    .and_then(Value::as_bool)
                    .unwrap_or(true);
                CompiledSchema::Object {
                    properties,
                    required,
                    additional_allowed,
                }
            }
            // Union types, $refs, missing type: accept anything.
            _ => CompiledSchema::Any,
        }
    }

    pub fn validate(&self, value: &Value) -> Result<(), SchemaViolation> {
        self.check(value, "$")
    }

    fn check(&self, value: &Value, path: &str) -> Result<(), SchemaViolation> {
        match self {
            CompiledSchema::Any => Ok(()),
            CompiledSchema::Boolean => match value {
                Value::Bool(_) => Ok(()),
                other => Err(SchemaViolation::new(
                    path,
                    format!("expected boolean, got {}", type_name(other)),
                )),
            },
            CompiledSchema::Integer => match value {
                Value::Number(num) if num.is_i64() || num.is_u64() => Ok(()),
                other => Err(SchemaViolation::new(
                    path,
                    format!("expected integer, got {}", type_name(other)),
                )),
            },
            CompiledSchema::Number => match value {
                Value::Number(_) => Ok(()),
                other => Err(SchemaViolation::new(
                    path,
                    format!("expected number, got {}", type_name(other)),
                )),
            },
            CompiledSchema::String { allowed } => match value {
                Value::String(text) => match allowed {
                    Some(values) if !values.iter().any(|candidate| candidate == text) => {
                        Err(SchemaViolation::new(
                            path,
                            format!("'{text}' is not one of the allowed values"),
                        ))
                    }
                    _ => Ok(()),
                },
                other => Err(SchemaViolation::new(
                    path,
                    format!("expected string, got {}", type_name(other)),
                )),
            },
            CompiledSchema::Array { items } => match value {
                Value::Array(entries) => {
                    if let Some(schema) = items {
                        for (index, entry) in entries.iter().enumerate() {
                            schema.check(entry, &format!("{path}[{index}]"))?;
                        }
                    }
                    Ok(())
                }
                other => Err(SchemaViolation::new(
                    path,
                    format!("expected array, got {}", type_name(other)),
                )),
            },
            CompiledSchema::Object {
                properties,
                required,
                additional_allowed,
            } => match value {
                Value::Object(map) => {
                    for name in required {
                        if !map.contains_key(name) {
                            return Err(SchemaViolation::new(
                                path,
                                format!("missing required property '{name}'"),
                            ));
                        }
                    }
                    for (key, entry) in map {
                        match properties.get(key) {
                            Some(schema) => schema.check(entry, &format!("{path}.{key}"))?,
                            None if !additional_allowed => {
                                return Err(SchemaViolation::new(
                                    path,
                                    format!("unexpected property '{key}'"),
                                ));
                            }
                            None => {}
                        }
                    }
                    Ok(())
                }
                other => Err(SchemaViolation::new(
                    path,
                    format!("expected object, got {}", type_name(other)),
                )),
            },
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
