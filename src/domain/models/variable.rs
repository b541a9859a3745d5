//! Workflow variable values.
//!
//! Workflow variables are a heterogeneous map. Values are modelled as a
//! tagged union that is lossless under JSON round-trips; anything that
//! cannot be represented (non-finite floats, live resource handles from
//! the engine) is replaced by a placeholder string so a checkpoint can
//! always be written.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Prefix marking a variable that could not be serialized.
///
/// Placeholders survive in checkpoints for diagnostics but are never
/// copied back into a resumed execution context.
pub const NON_SERIALIZABLE_PREFIX: &str = "<non-serializable:";

/// A single workflow variable value.
///
/// Variant order matters for untagged deserialization: integers must be
/// tried before floats so `3` stays an `Int`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VariableValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<VariableValue>),
    Map(HashMap<String, VariableValue>),
}

/// Map of variable name to value.
pub type VariableMap = HashMap<String, VariableValue>;

impl VariableValue {
    /// Build the placeholder for a value of the given type name.
    pub fn non_serializable(type_name: &str) -> Self {
        Self::Str(format!("{} {}>", NON_SERIALIZABLE_PREFIX, type_name))
    }

    /// Whether this value is a non-serializable placeholder.
    pub fn is_non_serializable(&self) -> bool {
        matches!(self, Self::Str(s) if s.starts_with(NON_SERIALIZABLE_PREFIX))
    }

    /// Whether this is a primitive (fast-path in checkpoint capture).
    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            Self::Null | Self::Bool(_) | Self::Int(_) | Self::Float(_) | Self::Str(_)
        )
    }

    /// Short type name used in placeholders and diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::List(_) => "list",
            Self::Map(_) => "map",
        }
    }

    /// Whether the value serializes cleanly to JSON.
    ///
    /// Non-finite floats have no JSON representation; collections are
    /// checked recursively.
    pub fn is_json_safe(&self) -> bool {
        match self {
            Self::Float(f) => f.is_finite(),
            Self::List(items) => items.iter().all(Self::is_json_safe),
            Self::Map(entries) => entries.values().all(Self::is_json_safe),
            _ => true,
        }
    }

    /// Convert from an arbitrary JSON value.
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else {
                    Self::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => Self::Str(s),
            serde_json::Value::Array(items) => {
                Self::List(items.into_iter().map(Self::from_json).collect())
            }
            serde_json::Value::Object(entries) => Self::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Convert into a JSON value; non-finite floats become `null`.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(i) => serde_json::Value::Number((*i).into()),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Self::Str(s) => serde_json::Value::String(s.clone()),
            Self::List(items) => {
                serde_json::Value::Array(items.iter().map(Self::to_json).collect())
            }
            Self::Map(entries) => serde_json::Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

impl From<bool> for VariableValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for VariableValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for VariableValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for VariableValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for VariableValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

/// Convert a JSON object into a variable map; non-object values yield an
/// empty map.
pub fn variables_from_json(value: serde_json::Value) -> VariableMap {
    match value {
        serde_json::Value::Object(entries) => entries
            .into_iter()
            .map(|(k, v)| (k, VariableValue::from_json(v)))
            .collect(),
        _ => VariableMap::new(),
    }
}
