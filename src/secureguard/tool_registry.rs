//! Tool Registry
//!
//! The registry maps tool names to [`ToolSpec`] descriptors.  It is populated once at
//! startup (either from the remote tool server's catalog or from the built-in
//! [`catalog`](crate::catalog)) and then shared read-only behind an `Arc`.
//!
//! Both execution paths consult it before anything is dispatched: direct calls typed by
//! the user and tool calls proposed by the LLM go through [`ToolRegistry::validate`].
//!
//! # Example
//!
//! ```rust
//! use secureguard::tool_registry::{ToolParameter, ToolParameterType, ToolRegistry, ToolSpec};
//! use serde_json::json;
//!
//! let mut registry = ToolRegistry::new();
//! registry
//!     .register(
//!         ToolSpec::new("get_case_details", "Get details for a case")
//!             .with_parameter(ToolParameter::new("case_id", ToolParameterType::String).required()),
//!     )
//!     .unwrap();
//!
//! assert!(registry.validate("get_case_details", &json!({"case_id": "CASE001"})).is_ok());
//! assert!(registry.validate("get_case_details", &json!({})).is_err());
//! ```

use crate::secureguard::error::{Result, SecureGuardError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Arguments passed to a tool: a JSON object keyed by parameter name.
pub type ToolArguments = serde_json::Map<String, Value>;

/// Defines the type of a tool parameter
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ToolParameterType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

impl ToolParameterType {
    /// Whether `value` can satisfy this type.
    ///
    /// Direct calls only ever carry strings, so numeric and boolean parameters also accept
    /// strings that parse as such.
    fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (ToolParameterType::String, Value::String(_))
            | (ToolParameterType::String, Value::Number(_))
            | (ToolParameterType::String, Value::Bool(_)) => true,
            (ToolParameterType::Number, Value::Number(_)) => true,
            (ToolParameterType::Number, Value::String(s)) => s.trim().parse::<f64>().is_ok(),
            (ToolParameterType::Integer, Value::Number(n)) => n.is_i64() || n.is_u64(),
            (ToolParameterType::Integer, Value::String(s)) => s.trim().parse::<i64>().is_ok(),
            (ToolParameterType::Boolean, Value::Bool(_)) => true,
            (ToolParameterType::Boolean, Value::String(s)) => {
                matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "false")
            }
            (ToolParameterType::Array, Value::Array(_)) => true,
            (ToolParameterType::Object, Value::Object(_)) => true,
            _ => false,
        }
    }
}

/// Defines a parameter for a tool
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ToolParameterType,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
}

impl ToolParameter {
    /// Define a new, optional parameter with the provided name and type.
    pub fn new(name: impl Into<String>, param_type: ToolParameterType) -> Self {
        Self {
            name: name.into(),
            param_type,
            description: None,
            required: false,
            default: None,
        }
    }

    /// Add a human readable description that will surface in generated schemas.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Mark the argument as required.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Record the value the tool server uses when the argument is omitted.
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

/// Immutable description of one callable tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Vec<ToolParameter>,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Vec::new(),
        }
    }

    /// Append a parameter definition, keeping declaration order.
    pub fn with_parameter(mut self, param: ToolParameter) -> Self {
        self.parameters.push(param);
        self
    }

    pub fn parameter(&self, name: &str) -> Option<&ToolParameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Check `arguments` against the declared parameters.
    ///
    /// Unknown names, missing required parameters and values of the wrong type are all
    /// reported as [`SecureGuardError::Validation`].
    pub fn validate_arguments(&self, arguments: &ToolArguments) -> Result<()> {
        for (key, value) in arguments {
            let param = self.parameter(key).ok_or_else(|| {
                SecureGuardError::Validation(format!(
                    "unknown parameter '{}' for tool '{}'",
                    key, self.name
                ))
            })?;
            if value.is_null() && !param.required {
                continue;
            }
            if !param.param_type.accepts(value) {
                return Err(SecureGuardError::Validation(format!(
                    "parameter '{}' of tool '{}' expects {:?}, got {}",
                    key, self.name, param.param_type, value
                )));
            }
        }

        for param in self.parameters.iter().filter(|p| p.required) {
            match arguments.get(&param.name) {
                Some(v) if !v.is_null() => {}
                _ => {
                    return Err(SecureGuardError::Validation(format!(
                        "missing required parameter '{}' for tool '{}'",
                        param.name, self.name
                    )))
                }
            }
        }

        Ok(())
    }

    /// Render the tool in the function-calling format expected by OpenAI compatible APIs.
    pub fn to_function_schema(&self) -> Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();

        for param in &self.parameters {
            let mut property = serde_json::json!({
                "type": param.param_type,
                "description": param.description.as_deref().unwrap_or("")
            });
            if let Some(default) = &param.default {
                property["default"] = default.clone();
            }
            properties.insert(param.name.clone(), property);

            if param.required {
                required.push(param.name.clone());
            }
        }

        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": {
                    "type": "object",
                    "properties": properties,
                    "required": required
                }
            }
        })
    }
}

/// Name → [`ToolSpec`] table preserving registration order.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    specs: Vec<ToolSpec>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from a list of specs, failing on the first duplicate name.
    pub fn from_specs(specs: impl IntoIterator<Item = ToolSpec>) -> Result<Self> {
        let mut registry = Self::new();
        for spec in specs {
            registry.register(spec)?;
        }
        Ok(registry)
    }

    /// Register a new tool. Names are unique.
    pub fn register(&mut self, spec: ToolSpec) -> Result<()> {
        if self.index.contains_key(&spec.name) {
            return Err(SecureGuardError::DuplicateName(spec.name));
        }
        self.index.insert(spec.name.clone(), self.specs.len());
        self.specs.push(spec);
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Result<&ToolSpec> {
        self.index
            .get(name)
            .map(|&i| &self.specs[i])
            .ok_or_else(|| SecureGuardError::UnknownTool(name.to_string()))
    }

    /// All specs in registration order.
    pub fn list(&self) -> &[ToolSpec] {
        &self.specs
    }

    pub fn names(&self) -> Vec<String> {
        self.specs.iter().map(|s| s.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Resolve `name` and validate `arguments` against it.
    ///
    /// `arguments` must be a JSON object; `null` is treated as an empty argument set since
    /// LLMs routinely send it for parameterless tools.
    pub fn validate(&self, name: &str, arguments: &Value) -> Result<&ToolSpec> {
        let spec = self.resolve(name)?;
        match arguments {
            Value::Object(map) => spec.validate_arguments(map)?,
            Value::Null => spec.validate_arguments(&ToolArguments::new())?,
            other => {
                return Err(SecureGuardError::Validation(format!(
                    "arguments for tool '{}' must be an object, got {}",
                    name, other
                )))
            }
        }
        Ok(spec)
    }
}

/// `specs` rendered as OpenAI style function definitions, order preserved.
pub fn function_schemas(specs: &[ToolSpec]) -> Vec<Value> {
    specs.iter().map(ToolSpec::to_function_schema).collect()
}
