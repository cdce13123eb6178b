use crate::validation::FieldError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Declared type of a variable, used to cast evaluated values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VarType {
    Object,
    Boolean,
    Array,
    Number,
    String,
    Integer,
    /// No declared type: evaluated strings stay strings, other values pass through.
    #[default]
    #[serde(rename = "", alias = "unset")]
    Unset,
}

impl fmt::Display for VarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VarType::Object => "object",
            VarType::Boolean => "boolean",
            VarType::Array => "array",
            VarType::Number => "number",
            VarType::String => "string",
            VarType::Integer => "integer",
            VarType::Unset => "unset",
        };
        f.write_str(name)
    }
}

/// A named default whose value may be a template referencing earlier variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaultVariable {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub default: Option<Value>,

    /// Replace a value already present in the context.
    #[serde(default)]
    pub overwrite: bool,

    #[serde(rename = "type", default)]
    pub var_type: VarType,
}

impl DefaultVariable {
    pub fn new(name: impl Into<String>, default: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            default: Some(default.into()),
            overwrite: false,
            var_type: VarType::Unset,
        }
    }

    pub fn with_type(mut self, var_type: VarType) -> Self {
        self.var_type = var_type;
        self
    }

    pub fn overwriting(mut self) -> Self {
        self.overwrite = true;
        self
    }

    pub fn validate(&self) -> Result<(), FieldError> {
        let mut missing = Vec::new();
        if self.default.is_none() {
            missing.push("default");
        }
        if self.name.is_empty() {
            missing.push("name");
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(FieldError::missing(&missing))
        }
    }
}
