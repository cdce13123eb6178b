use crate::cast::{cast, to_plain_string};
use crate::context::VarContext;
use crate::error::{Result, VarContextError};
use crate::eval::evaluate_value;
use crate::variable::{DefaultVariable, VarType};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::trace;

/// Accumulates variables from several sources.
///
/// Calls chain by value. The first failing call is remembered and every
/// later call becomes a no-op; [`ContextBuilder::build`] returns that error.
///
/// Constants registered with [`ContextBuilder::set_eval_constants`] are laid
/// over the merged values whenever a template is evaluated, so a plain merge
/// of the same key changes the map but never what expressions see.
#[derive(Debug, Default)]
pub struct ContextBuilder {
    context: Map<String, Value>,
    constants: Map<String, Value>,
    error: Option<VarContextError>,
}

impl ContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last write wins for every key in `map`.
    pub fn merge_map(mut self, map: &Map<String, Value>) -> Self {
        if self.error.is_none() {
            for (k, v) in map {
                self.context.insert(k.clone(), v.clone());
            }
        }
        self
    }

    /// Evaluate and cast each default, in order, against the context built so far.
    ///
    /// Entries without a default are skipped, as are entries whose key is
    /// already set unless they are marked `overwrite`.
    pub fn merge_default_with_eval(mut self, defaults: &[DefaultVariable]) -> Self {
        for var in defaults {
            if self.error.is_some() {
                break;
            }
            let Some(default) = &var.default else {
                continue;
            };
            if self.context.contains_key(&var.name) && !var.overwrite {
                trace!(name = %var.name, "keeping existing value over default");
                continue;
            }

            let result = match default {
                Value::String(template) => self
                    .eval(&var.name, template)
                    .and_then(|value| settle(value, var.var_type)),
                other => cast(other.clone(), var.var_type),
            };

            match result {
                Ok(value) => {
                    self.context.insert(var.name.clone(), value);
                }
                Err(e) => self.error = Some(e),
            }
        }
        self
    }

    /// Evaluate `template` now and store the result, cast to `var_type`, under `name`.
    pub fn merge_eval_result(mut self, name: &str, template: &str, var_type: VarType) -> Self {
        if self.error.is_some() {
            return self;
        }
        match self
            .eval(name, template)
            .and_then(|value| settle(value, var_type))
        {
            Ok(value) => {
                self.context.insert(name.to_string(), value);
            }
            Err(e) => self.error = Some(e),
        }
        self
    }

    /// Merge the top-level keys of a JSON object; nested values are replaced whole.
    ///
    /// Empty input is treated as an empty object.
    pub fn merge_json_object(mut self, raw: &[u8]) -> Self {
        if self.error.is_some() || raw.iter().all(u8::is_ascii_whitespace) {
            return self;
        }
        match serde_json::from_slice::<Value>(raw) {
            Ok(Value::Object(map)) => self.merge_map(&map),
            Ok(other) => {
                self.error = Some(VarContextError::Parse(format!(
                    "expected a JSON object, got {}",
                    json_kind(&other)
                )));
                self
            }
            Err(e) => {
                self.error = Some(VarContextError::Parse(e.to_string()));
                self
            }
        }
    }

    /// Merge the fields of a serializable struct, honouring `#[serde(rename)]`.
    pub fn merge_struct<T: Serialize>(mut self, value: &T) -> Self {
        if self.error.is_some() {
            return self;
        }
        match serde_json::to_value(value) {
            Ok(Value::Object(map)) => self.merge_map(&map),
            Ok(other) => {
                self.error = Some(VarContextError::Parse(format!(
                    "expected a struct, got {}",
                    json_kind(&other)
                )));
                self
            }
            Err(e) => {
                self.error = Some(VarContextError::Parse(e.to_string()));
                self
            }
        }
    }

    /// Register constants visible to every later evaluation.
    pub fn set_eval_constants(mut self, constants: &Map<String, Value>) -> Self {
        if self.error.is_none() {
            for (k, v) in constants {
                self.constants.insert(k.clone(), v.clone());
            }
        }
        self
    }

    pub fn build(self) -> Result<VarContext> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(VarContext::new(self.context)),
        }
    }

    pub fn build_map(self) -> Result<Map<String, Value>> {
        self.build().map(VarContext::into_map)
    }

    fn eval(&self, name: &str, template: &str) -> Result<Value> {
        let mut scope = self.context.clone();
        for (k, v) in &self.constants {
            scope.insert(k.clone(), v.clone());
        }
        evaluate_value(template, &scope).map_err(|reason| VarContextError::Evaluation {
            name: name.to_string(),
            template: template.to_string(),
            reason,
        })
    }
}

/// Cast an evaluated template. Untyped results stay text, as they would
/// have been rendered.
fn settle(value: Value, var_type: VarType) -> Result<Value> {
    match var_type {
        VarType::Unset => Ok(Value::String(to_plain_string(&value))),
        typed => cast(value, typed),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
