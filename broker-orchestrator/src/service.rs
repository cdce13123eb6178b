//! Service definitions: the catalog entries the broker can provision.
//!
//! A definition is plain data loaded from YAML. Each action (provision,
//! bind) carries the engine template plus the inputs users may supply and
//! the inputs the broker computes from them.

use crate::error::{BrokerError, Result};
use broker_varcontext::cast::to_plain_string;
use broker_varcontext::{DefaultVariable, FieldError};
use broker_workspace::{ModuleDefinition, DEFAULT_MODULE_NAME};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::OnceLock;
use tracing::{debug, info, instrument};

fn field_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-z0-9_]+$").expect("Hardcoded field name pattern should always compile")
    })
}

/// JSON type a user input must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JsonType {
    #[default]
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
}

impl JsonType {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            JsonType::String => value.is_string(),
            JsonType::Integer => {
                value.is_i64()
                    || value.is_u64()
                    || value.as_f64().is_some_and(|f| f.fract() == 0.0)
            }
            JsonType::Number => value.is_number(),
            JsonType::Boolean => value.is_boolean(),
            JsonType::Object => value.is_object(),
            JsonType::Array => value.is_array(),
        }
    }
}

impl fmt::Display for JsonType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JsonType::String => "string",
            JsonType::Integer => "integer",
            JsonType::Number => "number",
            JsonType::Boolean => "boolean",
            JsonType::Object => "object",
            JsonType::Array => "array",
        };
        f.write_str(name)
    }
}

/// An input a user may supply, with its constraints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrokerVariable {
    pub field_name: String,

    #[serde(rename = "type", default)]
    pub json_type: JsonType,

    #[serde(default)]
    pub details: String,

    #[serde(default)]
    pub default: Option<Value>,

    #[serde(default)]
    pub required: bool,

    /// Rejected on update when the value differs from the provisioned one.
    #[serde(default)]
    pub prohibit_update: bool,

    /// Allowed values, keyed by their string form, with descriptions.
    #[serde(default, rename = "enum", skip_serializing_if = "BTreeMap::is_empty")]
    pub allowed: BTreeMap<String, String>,

    #[serde(default)]
    pub pattern: Option<String>,

    #[serde(default)]
    pub minimum: Option<f64>,

    #[serde(default)]
    pub maximum: Option<f64>,
}

impl BrokerVariable {
    pub fn new(field_name: impl Into<String>, json_type: JsonType) -> Self {
        Self {
            field_name: field_name.into(),
            json_type,
            ..Self::default()
        }
    }

    /// Check a user-supplied value against the declared type and constraints.
    pub fn check(&self, value: &Value) -> std::result::Result<(), FieldError> {
        let path = self.field_name.as_str();
        if !self.json_type.matches(value) {
            return Err(FieldError::invalid_value(value, path)
                .with_details(format!("{path} must be of type {}", self.json_type)));
        }

        let mut errors = None;
        if !self.allowed.is_empty() && !self.allowed.contains_key(&to_plain_string(value)) {
            let allowed: Vec<&str> = self.allowed.keys().map(String::as_str).collect();
            errors = FieldError::merge(
                errors,
                FieldError::invalid_value(value, path)
                    .with_details(format!("{path} must be one of: {}", allowed.join(", "))),
            );
        }

        if let (Some(pattern), Some(s)) = (&self.pattern, value.as_str()) {
            match Regex::new(pattern) {
                Ok(re) if re.is_match(s) => {}
                Ok(_) => {
                    errors = FieldError::merge(
                        errors,
                        FieldError::invalid_value(value, path)
                            .with_details(format!("{path} must match {pattern}")),
                    );
                }
                Err(e) => {
                    errors = FieldError::merge(
                        errors,
                        FieldError::new(format!("invalid pattern: {e}"), path),
                    );
                }
            }
        }

        if let Some(n) = value.as_f64() {
            if self.minimum.is_some_and(|min| n < min) || self.maximum.is_some_and(|max| n > max) {
                errors = FieldError::merge(
                    errors,
                    FieldError::invalid_value(value, path).with_details(format!(
                        "{path} must be within [{}, {}]",
                        self.minimum.map_or("-inf".to_string(), |m| m.to_string()),
                        self.maximum.map_or("inf".to_string(), |m| m.to_string()),
                    )),
                );
            }
        }

        errors.map_or(Ok(()), Err)
    }
}

/// A resource adopted by an import operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportVariable {
    pub field_name: String,

    #[serde(rename = "type", default)]
    pub json_type: JsonType,

    #[serde(default)]
    pub details: String,

    /// Engine resource address the supplied id is imported into.
    pub tf_resource: String,
}

/// Template and inputs for one broker action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceAction {
    #[serde(default)]
    pub user_inputs: Vec<BrokerVariable>,

    #[serde(default)]
    pub computed_inputs: Vec<DefaultVariable>,

    #[serde(default)]
    pub template: String,

    /// Extra template files, keyed by file stem.
    #[serde(default)]
    pub templates: BTreeMap<String, String>,

    #[serde(default)]
    pub outputs: Vec<BrokerVariable>,

    #[serde(default)]
    pub import_inputs: Vec<ImportVariable>,
}

impl ServiceAction {
    pub fn module(&self) -> ModuleDefinition {
        self.templates.iter().fold(
            ModuleDefinition::new(DEFAULT_MODULE_NAME, self.template.clone()),
            |module, (stem, contents)| module.with_file(stem.clone(), contents.clone()),
        )
    }

    pub fn user_input(&self, field_name: &str) -> Option<&BrokerVariable> {
        self.user_inputs.iter().find(|v| v.field_name == field_name)
    }

    fn validate(&self) -> std::result::Result<(), FieldError> {
        let mut errors = None;
        let mut seen = HashSet::new();

        for (i, input) in self.user_inputs.iter().enumerate() {
            let path = format!("user_inputs[{i}]");
            if !field_name_pattern().is_match(&input.field_name) {
                errors = FieldError::merge(
                    errors,
                    FieldError::invalid_value(&input.field_name, "field_name").via_field(&path),
                );
            }
            if !seen.insert(input.field_name.as_str()) {
                errors = FieldError::merge(
                    errors,
                    FieldError::new("duplicate field", "field_name").via_field(&path),
                );
            }
            if let Some(pattern) = &input.pattern {
                if Regex::new(pattern).is_err() {
                    errors = FieldError::merge(
                        errors,
                        FieldError::invalid_value(pattern, "pattern").via_field(&path),
                    );
                }
            }
        }

        for (i, computed) in self.computed_inputs.iter().enumerate() {
            if let Err(e) = computed.validate() {
                errors = FieldError::merge(errors, e.via_field(&format!("computed_inputs[{i}]")));
            }
        }

        for (i, import) in self.import_inputs.iter().enumerate() {
            if import.tf_resource.is_empty() || import.field_name.is_empty() {
                errors = FieldError::merge(
                    errors,
                    FieldError::missing(&["field_name", "tf_resource"])
                        .via_field(&format!("import_inputs[{i}]")),
                );
            }
        }

        errors.map_or(Ok(()), Err)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServicePlan {
    pub id: String,
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Plan-level variable values, lowest precedence.
    #[serde(default)]
    pub properties: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub id: String,
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub plans: Vec<ServicePlan>,

    #[serde(default)]
    pub provision: ServiceAction,

    #[serde(default)]
    pub bind: ServiceAction,
}

impl ServiceDefinition {
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let definition: ServiceDefinition = serde_yaml_ng::from_str(raw)
            .map_err(|e| BrokerError::Definition(e.to_string()))?;
        definition.validate()?;
        Ok(definition)
    }

    pub fn plan(&self, plan_id: &str) -> Result<&ServicePlan> {
        self.plans
            .iter()
            .find(|p| p.id == plan_id)
            .ok_or_else(|| BrokerError::PlanNotFound {
                service_id: self.id.clone(),
                plan_id: plan_id.to_string(),
            })
    }

    pub fn validate(&self) -> std::result::Result<(), FieldError> {
        let mut errors = None;

        let mut missing = Vec::new();
        if self.id.is_empty() {
            missing.push("id");
        }
        if self.name.is_empty() {
            missing.push("name");
        }
        if !missing.is_empty() {
            errors = FieldError::merge(errors, FieldError::missing(&missing));
        }

        if self.plans.is_empty() {
            errors = FieldError::merge(errors, FieldError::missing(&["plans"]));
        }
        let mut plan_ids = HashSet::new();
        for (i, plan) in self.plans.iter().enumerate() {
            let path = format!("plans[{i}]");
            if plan.id.is_empty() || plan.name.is_empty() {
                errors = FieldError::merge(
                    errors,
                    FieldError::missing(&["id", "name"]).via_field(&path),
                );
            } else if !plan_ids.insert(plan.id.as_str()) {
                errors = FieldError::merge(
                    errors,
                    FieldError::new("duplicate plan id", "id").via_field(&path),
                );
            }
        }

        if let Err(e) = self.provision.validate() {
            errors = FieldError::merge(errors, e.via_field("provision"));
        }
        if let Err(e) = self.bind.validate() {
            errors = FieldError::merge(errors, e.via_field("bind"));
        }

        errors.map_or(Ok(()), Err)
    }
}

/// Service definitions known to the broker, by id.
#[derive(Debug, Clone, Default)]
pub struct ServiceRegistry {
    services: HashMap<String, ServiceDefinition>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, definition: ServiceDefinition) -> Result<()> {
        definition.validate()?;
        if self.services.contains_key(&definition.id) {
            return Err(BrokerError::Definition(format!(
                "service {} is already registered",
                definition.id
            )));
        }
        info!(service_id = %definition.id, name = %definition.name, "registered service");
        self.services.insert(definition.id.clone(), definition);
        Ok(())
    }

    pub fn get(&self, service_id: &str) -> Result<&ServiceDefinition> {
        self.services
            .get(service_id)
            .ok_or_else(|| BrokerError::ServiceNotFound(service_id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Register every `*.yml`/`*.yaml` file in `dir`, in file name order.
    #[instrument(skip_all, fields(dir = %dir.display()))]
    pub fn load_dir(&mut self, dir: &Path) -> Result<()> {
        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.is_file()
                    && p.extension()
                        .and_then(|e| e.to_str())
                        .is_some_and(|e| e == "yml" || e == "yaml")
            })
            .collect();
        paths.sort();

        for path in paths {
            debug!(path = %path.display(), "loading service definition");
            let raw = std::fs::read_to_string(&path)?;
            let definition = ServiceDefinition::from_yaml(&raw).map_err(|e| {
                BrokerError::Definition(format!("{}: {}", path.display(), e))
            })?;
            self.register(definition)?;
        }
        Ok(())
    }
}
