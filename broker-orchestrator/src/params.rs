//! Turning request parameters into the variables an action runs with.

use crate::error::Result;
use crate::service::{ServiceAction, ServicePlan};
use broker_varcontext::{ContextBuilder, FieldError, VarContext};
use broker_workspace::ModuleDefinition;
use serde_json::{json, Map, Value};

/// Identity of the request an action runs for. Exposed to templates as
/// `request.*`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestContext {
    pub instance_id: String,
    pub service_id: String,
    pub plan_id: String,
    pub originating_identity: Map<String, Value>,
    pub binding_id: Option<String>,
    pub app_guid: Option<String>,
}

impl RequestContext {
    pub fn new(
        instance_id: impl Into<String>,
        service_id: impl Into<String>,
        plan_id: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            service_id: service_id.into(),
            plan_id: plan_id.into(),
            ..Self::default()
        }
    }

    pub fn with_identity(mut self, identity: Map<String, Value>) -> Self {
        self.originating_identity = identity;
        self
    }

    pub fn for_binding(mut self, binding_id: impl Into<String>, app_guid: Option<String>) -> Self {
        self.binding_id = Some(binding_id.into());
        self.app_guid = app_guid;
        self
    }

    /// Evaluation constants for this request.
    pub fn constants(&self, plan: &ServicePlan) -> Map<String, Value> {
        let mut request = Map::new();
        request.insert("instance_id".into(), json!(self.instance_id));
        request.insert("service_id".into(), json!(self.service_id));
        request.insert("plan_id".into(), json!(self.plan_id));
        request.insert(
            "originating_identity".into(),
            Value::Object(self.originating_identity.clone()),
        );
        request.insert(
            "plan_properties".into(),
            Value::Object(plan.properties.clone()),
        );
        if let Some(binding_id) = &self.binding_id {
            request.insert("binding_id".into(), json!(binding_id));
            request.insert(
                "app_guid".into(),
                json!(self.app_guid.clone().unwrap_or_default()),
            );
        }

        let mut constants = Map::new();
        constants.insert("request".into(), Value::Object(request));
        constants
    }
}

/// Parse raw request parameters. An empty body means no parameters.
pub fn parse_parameters(raw: &[u8]) -> Result<Map<String, Value>> {
    Ok(ContextBuilder::new().merge_json_object(raw).build_map()?)
}

/// Type-check every supplied parameter the action declares.
pub fn validate_user_parameters(
    action: &ServiceAction,
    params: &Map<String, Value>,
) -> std::result::Result<(), FieldError> {
    let mut errors = None;
    for (name, value) in params {
        if let Some(input) = action.user_input(name) {
            if let Err(e) = input.check(value) {
                errors = FieldError::merge(errors, e);
            }
        }
    }
    errors.map_or(Ok(()), Err)
}

/// Reject updates that change inputs which cannot change after provisioning.
pub fn check_prohibited_updates(
    action: &ServiceAction,
    provisioned: &Map<String, Value>,
    requested: &Map<String, Value>,
) -> std::result::Result<(), FieldError> {
    let mut errors = None;
    for input in action.user_inputs.iter().filter(|i| i.prohibit_update) {
        let Some(new_value) = requested.get(&input.field_name) else {
            continue;
        };
        let current = provisioned
            .get(&input.field_name)
            .or(input.default.as_ref());
        if current != Some(new_value) {
            errors = FieldError::merge(
                errors,
                FieldError::new(
                    "attempt to update parameter that may result in service instance re-creation and data loss",
                    input.field_name.as_str(),
                ),
            );
        }
    }
    errors.map_or(Ok(()), Err)
}

/// Merge every variable source for an action.
///
/// From lowest to highest precedence: plan properties, user input defaults,
/// broker-wide configuration, request parameters. Computed inputs are
/// evaluated last and only replace existing values when marked to.
pub fn resolve_variables(
    action: &ServiceAction,
    plan: &ServicePlan,
    constants: &Map<String, Value>,
    broker_config: &Map<String, Value>,
    params: &Map<String, Value>,
) -> Result<VarContext> {
    let defaults: Map<String, Value> = action
        .user_inputs
        .iter()
        .filter_map(|i| i.default.clone().map(|d| (i.field_name.clone(), d)))
        .collect();

    let vc = ContextBuilder::new()
        .set_eval_constants(constants)
        .merge_map(&plan.properties)
        .merge_map(&defaults)
        .merge_map(broker_config)
        .merge_map(params)
        .merge_default_with_eval(&action.computed_inputs)
        .build()?;

    let missing: Vec<&str> = action
        .user_inputs
        .iter()
        .filter(|i| i.required && !vc.contains_key(&i.field_name))
        .map(|i| i.field_name.as_str())
        .collect();
    if !missing.is_empty() {
        return Err(FieldError::missing(&missing).into());
    }

    Ok(vc)
}

/// The subset of `vc` the module declares as input variables.
pub fn module_configuration(module: &ModuleDefinition, vc: &VarContext) -> Map<String, Value> {
    module
        .variables()
        .into_iter()
        .filter_map(|name| vc.get(&name).cloned().map(|v| (name, v)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BrokerError;
    use crate::service::{BrokerVariable, JsonType};
    use broker_varcontext::{DefaultVariable, VarType};

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn action() -> ServiceAction {
        ServiceAction {
            user_inputs: vec![
                BrokerVariable {
                    default: Some(json!("small")),
                    prohibit_update: true,
                    ..BrokerVariable::new("tier", JsonType::String)
                },
                BrokerVariable {
                    required: true,
                    ..BrokerVariable::new("name", JsonType::String)
                },
                BrokerVariable::new("count", JsonType::Integer),
            ],
            computed_inputs: vec![
                DefaultVariable::new("label", "${request.instance_id}-${name}"),
                DefaultVariable::new("count", "${1 + 1}").with_type(VarType::Integer),
                DefaultVariable::new("region", "computed-${region}").overwriting(),
            ],
            template: "variable \"label\" {}\nvariable \"name\" {}\nvariable \"missing\" {}".into(),
            ..ServiceAction::default()
        }
    }

    fn plan() -> ServicePlan {
        ServicePlan {
            id: "plan".into(),
            name: "plan".into(),
            properties: obj(json!({"tier": "plan-tier", "region": "plan-region"})),
            ..ServicePlan::default()
        }
    }

    #[test]
    fn test_parse_parameters() {
        assert!(parse_parameters(b"").unwrap().is_empty());
        assert_eq!(
            parse_parameters(br#"{"a": {"b": 1}}"#).unwrap(),
            obj(json!({"a": {"b": 1}}))
        );
        assert!(matches!(
            parse_parameters(b"[1, 2]"),
            Err(BrokerError::Variables(_))
        ));
        assert!(parse_parameters(b"{oops").is_err());
    }

    #[test]
    fn test_validate_user_parameters() {
        let action = action();
        assert!(validate_user_parameters(&action, &obj(json!({"count": 3, "extra": true}))).is_ok());

        let err = validate_user_parameters(&action, &obj(json!({"count": "3", "name": 1})))
            .unwrap_err()
            .to_string();
        assert!(err.contains("count must be of type integer"), "{err}");
        assert!(err.contains("name must be of type string"), "{err}");
    }

    #[test]
    fn test_precedence() {
        let request = RequestContext::new("inst-1", "svc", "plan");
        let vc = resolve_variables(
            &action(),
            &plan(),
            &request.constants(&plan()),
            &obj(json!({"region": "broker-region"})),
            &obj(json!({"name": "db", "tier": "large", "count": 7})),
        )
        .unwrap();

        // user input default beats plan property, user parameter beats both
        assert_eq!(vc.get("tier"), Some(&json!("large")));
        // computed input without overwrite leaves the user value alone
        assert_eq!(vc.get("count"), Some(&json!(7)));
        assert_eq!(vc.get("label"), Some(&json!("inst-1-db")));
        // computed input with overwrite sees the broker value and replaces it
        assert_eq!(vc.get("region"), Some(&json!("computed-broker-region")));
    }

    #[test]
    fn test_computed_input_fills_gap() {
        let request = RequestContext::new("inst-1", "svc", "plan");
        let vc = resolve_variables(
            &action(),
            &plan(),
            &request.constants(&plan()),
            &Map::new(),
            &obj(json!({"name": "db"})),
        )
        .unwrap();
        assert_eq!(vc.get("tier"), Some(&json!("small")));
        assert_eq!(vc.get("count"), Some(&json!(2)));
    }

    #[test]
    fn test_constants_cannot_be_shadowed() {
        let request = RequestContext::new("real-id", "svc", "plan");
        let vc = resolve_variables(
            &action(),
            &plan(),
            &request.constants(&plan()),
            &Map::new(),
            &obj(json!({"name": "db", "request": {"instance_id": "spoofed"}})),
        )
        .unwrap();
        assert_eq!(vc.get("label"), Some(&json!("real-id-db")));
    }

    #[test]
    fn test_required_inputs() {
        let err = resolve_variables(&action(), &plan(), &Map::new(), &Map::new(), &Map::new())
            .unwrap_err();
        // the label template references `name`, so evaluation fails first
        assert!(matches!(err, BrokerError::Variables(_)), "{err}");

        let action = ServiceAction {
            computed_inputs: vec![],
            ..action()
        };
        let err = resolve_variables(&action, &plan(), &Map::new(), &Map::new(), &Map::new())
            .unwrap_err();
        assert_eq!(err.to_string(), "validation error: missing field(s): name");
    }

    #[test]
    fn test_prohibited_updates() {
        let action = action();
        let provisioned = obj(json!({"tier": "large"}));

        assert!(check_prohibited_updates(&action, &provisioned, &obj(json!({"tier": "large"}))).is_ok());
        assert!(check_prohibited_updates(&action, &provisioned, &obj(json!({"name": "x"}))).is_ok());

        let err = check_prohibited_updates(&action, &provisioned, &obj(json!({"tier": "small"})))
            .unwrap_err();
        assert!(err.to_string().ends_with(": tier"), "{err}");

        // not supplied at provision time: compared with the default
        assert!(check_prohibited_updates(&action, &Map::new(), &obj(json!({"tier": "small"}))).is_ok());
        assert!(check_prohibited_updates(&action, &Map::new(), &obj(json!({"tier": "huge"}))).is_err());
    }

    #[test]
    fn test_module_configuration_filters_undeclared() {
        let request = RequestContext::new("inst-1", "svc", "plan");
        let action = action();
        let vc = resolve_variables(
            &action,
            &plan(),
            &request.constants(&plan()),
            &Map::new(),
            &obj(json!({"name": "db"})),
        )
        .unwrap();

        let config = module_configuration(&action.module(), &vc);
        assert_eq!(config, obj(json!({"label": "inst-1-db", "name": "db"})));
    }

    #[test]
    fn test_binding_constants() {
        let constants = RequestContext::new("i", "s", "p")
            .with_identity(obj(json!({"user_id": "u"})))
            .for_binding("b", None)
            .constants(&plan());
        assert_eq!(constants["request"]["binding_id"], json!("b"));
        assert_eq!(constants["request"]["app_guid"], json!(""));
        assert_eq!(constants["request"]["originating_identity"]["user_id"], json!("u"));
        assert_eq!(constants["request"]["plan_properties"]["tier"], json!("plan-tier"));
    }
}
