use crate::command::Command;
use crate::error::{Result, WorkspaceError};
use crate::executor::{EngineExecutor, ExecutionContext, ExecutionOutput, Invocation};
use crate::version::EngineVersion;
use broker_varcontext::FieldError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use tracing::{debug, info, instrument, warn};

const STATE_FILE: &str = "terraform.tfstate";

/// Module name used when a workspace is built from a single template.
pub const DEFAULT_MODULE_NAME: &str = "brokertemplate";
pub const DEFAULT_INSTANCE_NAME: &str = "instance";

fn output_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"(?m)^\s*output\s+"([^"]+)""#)
            .expect("Hardcoded output block pattern should always compile")
    })
}

fn variable_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"(?m)^\s*variable\s+"([^"]+)""#)
            .expect("Hardcoded variable block pattern should always compile")
    })
}

fn module_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-z_]+$").expect("Hardcoded module name pattern should always compile")
    })
}

/// Source of one engine module.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDefinition {
    pub name: String,

    /// Contents of `main.tf`.
    #[serde(default)]
    pub definition: String,

    /// Additional files, keyed by file stem.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub definitions: BTreeMap<String, String>,
}

impl ModuleDefinition {
    pub fn new(name: impl Into<String>, definition: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            definition: definition.into(),
            definitions: BTreeMap::new(),
        }
    }

    pub fn with_file(mut self, stem: impl Into<String>, contents: impl Into<String>) -> Self {
        self.definitions.insert(stem.into(), contents.into());
        self
    }

    pub fn validate(&self) -> std::result::Result<(), FieldError> {
        if module_name_pattern().is_match(&self.name) {
            Ok(())
        } else {
            Err(FieldError::invalid_value(&self.name, "name")
                .with_details("module names may only contain lowercase letters and underscores"))
        }
    }

    /// Names of the outputs the module declares, sorted.
    pub fn outputs(&self) -> Vec<String> {
        self.block_names(output_pattern())
    }

    /// Names of the input variables the module declares, sorted.
    pub fn variables(&self) -> Vec<String> {
        self.block_names(variable_pattern())
    }

    fn block_names(&self, pattern: &Regex) -> Vec<String> {
        let mut names: Vec<String> = std::iter::once(&self.definition)
            .chain(self.definitions.values())
            .flat_map(|source| {
                pattern
                    .captures_iter(source)
                    .map(|c| c[1].to_string())
                    .collect::<Vec<_>>()
            })
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

/// One use of a module with its input configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleInstance {
    pub module_name: String,
    pub instance_name: String,
    #[serde(default)]
    pub configuration: Map<String, Value>,
}

impl ModuleInstance {
    /// The engine JSON definition wiring this instance to its module and
    /// re-exporting `outputs` at the root.
    pub fn marshal_definition(&self, outputs: &[String]) -> Result<Vec<u8>> {
        let mut module: BTreeMap<String, Value> = self
            .configuration
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        module.insert(
            "source".to_string(),
            Value::String(format!("./{}", self.module_name)),
        );

        let mut root = BTreeMap::new();
        root.insert(
            "module",
            json!(BTreeMap::from([(self.instance_name.clone(), module)])),
        );

        if !outputs.is_empty() {
            let wired: BTreeMap<&str, Value> = outputs
                .iter()
                .map(|o| {
                    (
                        o.as_str(),
                        json!({ "value": format!("${{module.{}.{}}}", self.instance_name, o) }),
                    )
                })
                .collect();
            root.insert("output", json!(wired));
        }

        Ok(serde_json::to_vec(&root)?)
    }
}

/// Module sources, their instances and the recorded engine state for one deployment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TerraformWorkspace {
    pub modules: Vec<ModuleDefinition>,
    pub instances: Vec<ModuleInstance>,

    /// Engine state as written by the last execution.
    #[serde(default)]
    pub tfstate: Option<Value>,

    /// Output of the last step that succeeded.
    #[serde(default)]
    pub last_output: Option<ExecutionOutput>,
}

impl TerraformWorkspace {
    /// A workspace with one module and a single instance of it.
    pub fn new(module: ModuleDefinition, configuration: Map<String, Value>) -> Self {
        let module = ModuleDefinition {
            name: DEFAULT_MODULE_NAME.to_string(),
            ..module
        };
        Self {
            instances: vec![ModuleInstance {
                module_name: module.name.clone(),
                instance_name: DEFAULT_INSTANCE_NAME.to_string(),
                configuration,
            }],
            modules: vec![module],
            tfstate: None,
            last_output: None,
        }
    }

    pub fn from_json(raw: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(raw)?)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Replace the configuration of every instance.
    pub fn update_configuration(&mut self, configuration: &Map<String, Value>) {
        for instance in &mut self.instances {
            instance.configuration = configuration.clone();
        }
    }

    /// Swap module sources, keeping instances and state. Used when a
    /// service definition is upgraded in place.
    pub fn update_modules(&mut self, module: ModuleDefinition) {
        let name = self
            .modules
            .first()
            .map(|m| m.name.clone())
            .unwrap_or_else(|| DEFAULT_MODULE_NAME.to_string());
        self.modules = vec![ModuleDefinition { name, ..module }];
    }

    fn module(&self, name: &str) -> Result<&ModuleDefinition> {
        self.modules
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| WorkspaceError::ModuleNotFound(name.to_string()))
    }

    /// Engine version that wrote the recorded state, if any.
    pub fn state_version(&self) -> Result<Option<EngineVersion>> {
        match self
            .tfstate
            .as_ref()
            .and_then(|s| s.get("terraform_version"))
            .and_then(Value::as_str)
        {
            Some(raw) => raw.parse().map(Some),
            None => Ok(None),
        }
    }

    /// Root outputs from the recorded state that belong to `instance_name`'s module.
    pub fn outputs(&self, instance_name: &str) -> Result<Map<String, Value>> {
        let instance = self
            .instances
            .iter()
            .find(|i| i.instance_name == instance_name)
            .ok_or_else(|| WorkspaceError::ModuleNotFound(instance_name.to_string()))?;
        let declared = self.module(&instance.module_name)?.outputs();

        let recorded = self
            .tfstate
            .as_ref()
            .and_then(|s| s.get("outputs"))
            .and_then(Value::as_object);

        let mut outputs = Map::new();
        if let Some(recorded) = recorded {
            for name in declared {
                if let Some(value) = recorded.get(&name).and_then(|o| o.get("value")) {
                    outputs.insert(name, value.clone());
                }
            }
        }
        Ok(outputs)
    }

    /// Materialise the workspace, run `commands` in order and record the resulting state.
    ///
    /// Stops at the first failing command. The state file is read back even
    /// then, so a partial apply stays visible.
    #[instrument(skip_all, fields(steps = commands.len()))]
    pub fn execute(
        &mut self,
        ctx: &ExecutionContext,
        executor: &dyn EngineExecutor,
        commands: &[Command],
    ) -> Result<ExecutionOutput> {
        let scratch = tempfile::Builder::new().prefix("broker-workspace").tempdir()?;
        self.materialise(scratch.path())?;

        let mut last = ExecutionOutput::default();
        let mut failure = None;
        for command in commands {
            info!(command = %command, "running terraform step");
            match executor.execute(ctx, Invocation::new(command.args(), scratch.path())) {
                Ok(output) => {
                    self.last_output = Some(output.clone());
                    last = output;
                }
                Err(e) => {
                    warn!(step = command.name(), error = %e, "terraform step failed");
                    failure = Some(e);
                    break;
                }
            }
        }

        let readback = self.read_state(scratch.path());
        if let Err(e) = scratch.close() {
            warn!("failed to remove workspace directory: {}", e);
        }

        match (failure, readback) {
            (Some(e), _) => Err(e),
            (None, Err(e)) => Err(e),
            (None, Ok(())) => Ok(last),
        }
    }

    fn materialise(&self, dir: &Path) -> Result<()> {
        for module in &self.modules {
            let module_dir = dir.join(&module.name);
            fs::create_dir_all(&module_dir)?;
            fs::write(module_dir.join("main.tf"), &module.definition)?;
            for (stem, contents) in &module.definitions {
                fs::write(module_dir.join(format!("{stem}.tf")), contents)?;
            }
        }

        for instance in &self.instances {
            let outputs = self.module(&instance.module_name)?.outputs();
            let definition = instance.marshal_definition(&outputs)?;
            fs::write(dir.join(format!("{}.tf.json", instance.instance_name)), definition)?;
        }

        if let Some(state) = &self.tfstate {
            fs::write(dir.join(STATE_FILE), serde_json::to_vec_pretty(state)?)?;
        }
        debug!(dir = %dir.display(), "workspace materialised");
        Ok(())
    }

    fn read_state(&mut self, dir: &Path) -> Result<()> {
        let path = dir.join(STATE_FILE);
        if !path.exists() {
            return Ok(());
        }
        let raw = fs::read(&path)?;
        self.tfstate = Some(serde_json::from_slice(&raw)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeExecutor;

    fn sample_instance() -> ModuleInstance {
        ModuleInstance {
            module_name: "foo-module".to_string(),
            instance_name: "instance".to_string(),
            configuration: json!({"foo": "bar"}).as_object().cloned().unwrap(),
        }
    }

    #[test]
    fn test_marshal_definition() {
        let outputs = vec!["output1".to_string(), "output2".to_string()];
        let defn = sample_instance().marshal_definition(&outputs).unwrap();
        assert_eq!(
            String::from_utf8(defn).unwrap(),
            r#"{"module":{"instance":{"foo":"bar","source":"./foo-module"}},"output":{"output1":{"value":"${module.instance.output1}"},"output2":{"value":"${module.instance.output2}"}}}"#
        );
    }

    #[test]
    fn test_marshal_definition_empty_outputs() {
        let defn = sample_instance().marshal_definition(&[]).unwrap();
        assert_eq!(
            String::from_utf8(defn).unwrap(),
            r#"{"module":{"instance":{"foo":"bar","source":"./foo-module"}}}"#
        );
    }

    #[test]
    fn test_module_outputs() {
        let module = ModuleDefinition::new(
            "m",
            "variable \"x\" {}\noutput \"hostname\" { value = 1 }\n  output \"port\" {\n value = 2 }",
        )
        .with_file("extra", "output \"hostname\" { value = 3 }\noutput \"admin\" {}");
        assert_eq!(module.outputs(), vec!["admin", "hostname", "port"]);
        assert_eq!(module.variables(), vec!["x"]);
    }

    #[test]
    fn test_module_name_validation() {
        assert!(ModuleDefinition::new("brokertemplate", "").validate().is_ok());
        let err = ModuleDefinition::new("Bad-Name", "").validate().unwrap_err();
        assert!(err.to_string().starts_with("invalid value: Bad-Name: name"));
    }

    #[test]
    fn test_state_version() {
        let mut ws = TerraformWorkspace::default();
        assert_eq!(ws.state_version().unwrap(), None);

        ws.tfstate = Some(json!({"terraform_version": "0.12.20"}));
        assert_eq!(
            ws.state_version().unwrap(),
            Some(EngineVersion::new(0, 12, 20))
        );

        ws.tfstate = Some(json!({"terraform_version": "garbage"}));
        assert!(ws.state_version().is_err());
    }

    #[test]
    fn test_outputs_filtered_to_module() {
        let mut ws = TerraformWorkspace::new(
            ModuleDefinition::new("x", r#"output "name" { value = "x" }"#),
            Map::new(),
        );
        ws.tfstate = Some(json!({
            "outputs": {
                "name": {"value": "db-1", "type": "string"},
                "stray": {"value": "ignored", "type": "string"}
            }
        }));

        let outputs = ws.outputs(DEFAULT_INSTANCE_NAME).unwrap();
        assert_eq!(Value::Object(outputs), json!({"name": "db-1"}));
        assert!(ws.outputs("missing").is_err());
    }

    #[test]
    fn test_execute_materialises_and_reads_state_back() {
        let state = json!({"version": 4, "terraform_version": "1.1.4", "outputs": {}});
        let fake = FakeExecutor::new()
            .with_state("apply", state.clone())
            .with_stdout("apply", "Apply complete!");
        let mut ws = TerraformWorkspace::new(
            ModuleDefinition::new("x", r#"output "name" { value = var.name }"#),
            json!({"name": "db"}).as_object().cloned().unwrap(),
        );

        let out = ws
            .execute(
                &ExecutionContext::default(),
                &fake,
                &[Command::init("/plugins"), Command::Apply],
            )
            .unwrap();

        assert_eq!(out.stdout, "Apply complete!");
        assert_eq!(ws.tfstate, Some(state));
        assert_eq!(ws.last_output, Some(out));

        let files = fake.seen_files();
        assert!(files.contains(&"brokertemplate/main.tf".to_string()));
        assert!(files.contains(&"instance.tf.json".to_string()));
    }

    #[test]
    fn test_failed_step_aborts_and_keeps_partial_state() {
        let partial = json!({"version": 4, "terraform_version": "1.1.4", "partial": true});
        let fake = FakeExecutor::new()
            .with_state("apply", partial.clone())
            .fail_on("apply");
        let mut ws = TerraformWorkspace::new(ModuleDefinition::new("x", ""), Map::new());

        let err = ws
            .execute(
                &ExecutionContext::default(),
                &fake,
                &[Command::init("/plugins"), Command::Apply, Command::Show],
            )
            .unwrap_err();

        assert!(matches!(err, WorkspaceError::StepFailed { .. }));
        assert_eq!(ws.tfstate, Some(partial));
        let steps: Vec<String> = fake
            .invocations()
            .iter()
            .map(|i| i.step().to_string())
            .collect();
        assert_eq!(steps, vec!["init", "apply"]);
    }

    #[test]
    fn test_existing_state_is_written_for_the_engine() {
        let fake = FakeExecutor::new();
        let mut ws = TerraformWorkspace::new(ModuleDefinition::new("x", ""), Map::new());
        ws.tfstate = Some(json!({"terraform_version": "0.12.1"}));

        ws.execute(&ExecutionContext::default(), &fake, &[Command::Plan])
            .unwrap();

        assert!(fake.seen_files().contains(&STATE_FILE.to_string()));
        assert_eq!(ws.tfstate, Some(json!({"terraform_version": "0.12.1"})));
    }

    #[test]
    fn test_json_round_trip_preserves_state() {
        let mut ws = TerraformWorkspace::new(ModuleDefinition::new("x", "output \"a\" {}"), Map::new());
        ws.tfstate = Some(json!({"terraform_version": "1.0.0"}));
        let decoded = TerraformWorkspace::from_json(&ws.to_json().unwrap()).unwrap();
        assert_eq!(decoded, ws);
    }
}
