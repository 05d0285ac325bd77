//! Host function schemas and argument binding

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Declared type of a host function parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    List,
    Map,
}

impl ParamType {
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Integer => {
                value.is_i64()
                    || value.is_u64()
                    || value
                        .as_f64()
                        .map(|f| f.is_finite() && f.fract() == 0.0)
                        .unwrap_or(false)
            }
            ParamType::Number => value.is_number(),
            ParamType::Boolean => value.is_boolean(),
            // Empty script tables arrive as either shape
            ParamType::List => {
                value.is_array() || value.as_object().map(Map::is_empty).unwrap_or(false)
            }
            ParamType::Map => {
                value.is_object() || value.as_array().map(Vec::is_empty).unwrap_or(false)
            }
        }
    }

    /// Canonical form of an accepted value
    fn normalize(&self, value: Value) -> Value {
        match (self, &value) {
            (ParamType::Integer, Value::Number(n)) if !n.is_i64() && !n.is_u64() => n
                .as_f64()
                .map(|f| Value::from(f as i64))
                .unwrap_or(value),
            (ParamType::List, Value::Object(_)) => Value::Array(Vec::new()),
            (ParamType::Map, Value::Array(_)) => Value::Object(Map::new()),
            _ => value,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
            ParamType::List => "list",
            ParamType::Map => "map",
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One declared parameter of a host function
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostParam {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ParamType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl HostParam {
    pub fn required(name: impl Into<String>, ty: ParamType) -> Self {
        Self {
            name: name.into(),
            ty,
            required: true,
            description: None,
        }
    }

    pub fn optional(name: impl Into<String>, ty: ParamType) -> Self {
        Self {
            required: false,
            ..Self::required(name, ty)
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Name, description and ordered parameters of a host function.
///
/// Parameter order matters: positional arguments bind in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostFunctionSchema {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub params: Vec<HostParam>,
}

/// Arguments exactly as the script passed them
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawCallArgs {
    pub positional: Vec<Value>,
    pub named: Map<String, Value>,
}

impl RawCallArgs {
    pub fn positional(values: Vec<Value>) -> Self {
        Self {
            positional: values,
            named: Map::new(),
        }
    }

    pub fn named(values: Map<String, Value>) -> Self {
        Self {
            positional: Vec::new(),
            named: values,
        }
    }

    /// JSON rendering used when arguments could not be bound
    pub fn to_json(&self) -> Value {
        match (self.positional.is_empty(), self.named.is_empty()) {
            (_, true) => Value::Array(self.positional.clone()),
            (true, false) => Value::Object(self.named.clone()),
            (false, false) => serde_json::json!({
                "positional": self.positional,
                "named": self.named,
            }),
        }
    }
}

/// Why raw arguments could not be bound to a schema
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArgumentError {
    #[error("missing required argument `{0}`")]
    Missing(String),

    #[error("argument `{param}` expects {expected}, got {found}")]
    TypeMismatch {
        param: String,
        expected: ParamType,
        found: &'static str,
    },

    #[error("expected at most {expected} arguments, got {found}")]
    TooMany { expected: usize, found: usize },

    #[error("unknown argument `{0}`")]
    Unknown(String),
}

impl HostFunctionSchema {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            params: Vec::new(),
        }
    }

    pub fn param(mut self, param: HostParam) -> Self {
        self.params.push(param);
        self
    }

    pub fn required_count(&self) -> usize {
        self.params.iter().filter(|p| p.required).count()
    }

    fn has_param(&self, name: &str) -> bool {
        self.params.iter().any(|p| p.name == name)
    }

    /// Map raw arguments onto the declared parameters and validate them.
    ///
    /// Named arguments bind first, the remaining positional arguments fill the
    /// unbound parameters in declaration order. A lone table whose keys are
    /// all parameter names is treated as keyword arguments, unless the first
    /// parameter is itself a map. Null counts as absent.
    pub fn bind(&self, args: &RawCallArgs) -> Result<Map<String, Value>, ArgumentError> {
        let (positional, named) = self.split_keyword_table(args);

        let mut bound = Map::new();
        for (key, value) in named {
            if !self.has_param(&key) {
                return Err(ArgumentError::Unknown(key));
            }
            if !value.is_null() {
                bound.insert(key, value);
            }
        }

        let free: Vec<&HostParam> = self
            .params
            .iter()
            .filter(|p| !bound.contains_key(&p.name))
            .collect();
        if positional.len() > free.len() {
            return Err(ArgumentError::TooMany {
                expected: self.params.len(),
                found: bound.len() + positional.len(),
            });
        }
        for (param, value) in free.into_iter().zip(positional) {
            if !value.is_null() {
                bound.insert(param.name.clone(), value);
            }
        }

        for param in &self.params {
            match bound.remove(&param.name) {
                None if param.required => return Err(ArgumentError::Missing(param.name.clone())),
                None => {}
                Some(value) if !param.ty.accepts(&value) => {
                    return Err(ArgumentError::TypeMismatch {
                        param: param.name.clone(),
                        expected: param.ty,
                        found: json_type_name(&value),
                    })
                }
                Some(value) => {
                    bound.insert(param.name.clone(), param.ty.normalize(value));
                }
            }
        }
        Ok(bound)
    }

    fn split_keyword_table(&self, args: &RawCallArgs) -> (Vec<Value>, Map<String, Value>) {
        let first_is_map = self
            .params
            .first()
            .map(|p| p.ty == ParamType::Map)
            .unwrap_or(false);
        if args.named.is_empty() && args.positional.len() == 1 && !first_is_map {
            if let Some(table) = args.positional[0].as_object() {
                if !table.is_empty() && table.keys().all(|k| self.has_param(k)) {
                    return (Vec::new(), table.clone());
                }
            }
        }
        (args.positional.clone(), args.named.clone())
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}
