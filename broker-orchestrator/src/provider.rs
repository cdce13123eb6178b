//! Engine-backed operations on deployments.
//!
//! Provision, update, deprovision and import return as soon as the
//! operation is recorded; the engine runs in a tracked background task and
//! the outcome is written back to the deployment for polling. Bind and
//! unbind run to completion before returning.

use crate::error::{BrokerError, Result};
use broker_storage::{OperationState, OperationType, Storage, TerraformDeployment};
use broker_workspace::{
    ExecutionContext, ExecutionOutput, Invoker, ModuleDefinition, TerraformWorkspace,
    DEFAULT_INSTANCE_NAME,
};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, instrument, warn};

/// Deployment id for an instance (`binding_id` empty) or one of its bindings.
pub fn deployment_id(instance_id: &str, binding_id: &str) -> String {
    format!("tf:{instance_id}:{binding_id}")
}

/// What to run against a workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Apply,
    Destroy,
    PlanAndApply,
    /// Import `address -> id` pairs, then plan to confirm the adopted
    /// resources match the configuration.
    Import(BTreeMap<String, String>),
}

/// Last recorded operation of a deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationStatus {
    pub operation: OperationType,
    pub state: OperationState,
    pub message: String,
}

type Inflight = Arc<Mutex<HashSet<String>>>;

/// Marks a deployment busy until dropped.
struct InflightGuard {
    id: String,
    inflight: Inflight,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

#[derive(Clone)]
pub struct TerraformProvider {
    storage: Storage,
    invoker: Invoker,
    timeout: Option<Duration>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    inflight: Inflight,
}

impl TerraformProvider {
    pub fn new(storage: Storage, invoker: Invoker, timeout: Option<Duration>) -> Self {
        Self {
            storage,
            invoker,
            timeout,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            inflight: Arc::default(),
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    fn claim(&self, id: &str) -> Result<InflightGuard> {
        if self.shutdown.is_cancelled() {
            return Err(BrokerError::ShuttingDown);
        }
        let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        if !inflight.insert(id.to_string()) {
            return Err(BrokerError::OperationInProgress(id.to_string()));
        }
        Ok(InflightGuard {
            id: id.to_string(),
            inflight: self.inflight.clone(),
        })
    }

    /// One context per operation, so the timeout bounds all of its engine steps together.
    fn execution_context(&self) -> ExecutionContext {
        let ctx = ExecutionContext::new(self.shutdown.child_token());
        match self.timeout {
            Some(timeout) => ctx.with_timeout(timeout),
            None => ctx,
        }
    }

    /// Refuse to touch state written by a newer engine than the configured one.
    pub fn check_version(&self, workspace: &TerraformWorkspace) -> Result<()> {
        let configured = self.invoker.default_version();
        match workspace.state_version()? {
            Some(state) if state > configured => {
                Err(BrokerError::VersionIncompatible { state, configured })
            }
            _ => Ok(()),
        }
    }

    /// Fails when the deployment's state cannot be handled by the configured engine.
    pub async fn check_upgrade_available(&self, deployment_id: &str) -> Result<()> {
        let deployment = self.storage.get_terraform_deployment(deployment_id).await?;
        self.check_version(&deployment.workspace)
    }

    async fn find(&self, id: &str) -> Result<Option<TerraformDeployment>> {
        if !self.storage.exists_terraform_deployment(id).await? {
            return Ok(None);
        }
        Ok(Some(self.storage.get_terraform_deployment(id).await?))
    }

    pub async fn status(&self, deployment_id: &str) -> Result<Option<OperationStatus>> {
        Ok(self.find(deployment_id).await?.map(|d| OperationStatus {
            operation: d.last_operation_type,
            state: d.last_operation_state,
            message: d.last_operation_message,
        }))
    }

    /// Outputs recorded for a deployment's template.
    pub async fn outputs(&self, deployment_id: &str) -> Result<Map<String, Value>> {
        let deployment = self.storage.get_terraform_deployment(deployment_id).await?;
        Ok(deployment.workspace.outputs(DEFAULT_INSTANCE_NAME)?)
    }

    pub async fn delete_deployment(&self, deployment_id: &str) -> Result<()> {
        Ok(self.storage.delete_terraform_deployment(deployment_id).await?)
    }

    /// Start applying a new instance. A failed earlier attempt is retried
    /// on top of whatever state it left behind.
    #[instrument(skip(self, module, configuration))]
    pub async fn provision(
        &self,
        instance_id: &str,
        module: ModuleDefinition,
        configuration: Map<String, Value>,
    ) -> Result<String> {
        let id = deployment_id(instance_id, "");
        let guard = self.claim(&id)?;

        let workspace = match self.find(&id).await? {
            None => TerraformWorkspace::new(module, configuration),
            Some(existing) => match existing.last_operation_state {
                OperationState::InProgress => return Err(BrokerError::OperationInProgress(id)),
                OperationState::Succeeded => {
                    return Err(BrokerError::InstanceAlreadyExists(instance_id.to_string()))
                }
                OperationState::Failed => {
                    info!("retrying failed deployment");
                    self.check_version(&existing.workspace)?;
                    let mut workspace = existing.workspace;
                    workspace.update_modules(module);
                    workspace.update_configuration(&configuration);
                    workspace
                }
            },
        };

        let deployment = TerraformDeployment::new(&id, workspace, OperationType::Provision);
        self.start(guard, deployment, Action::Apply).await?;
        Ok(id)
    }

    #[instrument(skip(self, configuration))]
    pub async fn update(&self, instance_id: &str, configuration: Map<String, Value>) -> Result<String> {
        let id = deployment_id(instance_id, "");
        let guard = self.claim(&id)?;

        let mut deployment = self
            .find(&id)
            .await?
            .ok_or_else(|| BrokerError::InstanceNotFound(instance_id.to_string()))?;
        if deployment.last_operation_state == OperationState::InProgress {
            return Err(BrokerError::OperationInProgress(id));
        }
        self.check_version(&deployment.workspace)?;

        deployment.workspace.update_configuration(&configuration);
        deployment.last_operation_type = OperationType::Update;
        self.start(guard, deployment, Action::PlanAndApply).await?;
        Ok(id)
    }

    /// Start destroying an instance. Returns `None` when there is nothing to
    /// destroy and the caller may remove the instance right away.
    #[instrument(skip(self, configuration))]
    pub async fn deprovision(
        &self,
        instance_id: &str,
        configuration: Map<String, Value>,
    ) -> Result<Option<String>> {
        let id = deployment_id(instance_id, "");
        let guard = self.claim(&id)?;

        let Some(mut deployment) = self.find(&id).await? else {
            info!("no deployment recorded, nothing to destroy");
            return Ok(None);
        };
        if deployment.last_operation_state == OperationState::InProgress {
            return Err(BrokerError::OperationInProgress(id));
        }
        self.check_version(&deployment.workspace)?;

        deployment.workspace.update_configuration(&configuration);
        deployment.last_operation_type = OperationType::Deprovision;
        self.start(guard, deployment, Action::Destroy).await?;
        Ok(Some(id))
    }

    /// Start adopting existing resources into a new deployment.
    #[instrument(skip(self, module, configuration))]
    pub async fn import(
        &self,
        instance_id: &str,
        module: ModuleDefinition,
        configuration: Map<String, Value>,
        resources: BTreeMap<String, String>,
    ) -> Result<String> {
        let id = deployment_id(instance_id, "");
        let guard = self.claim(&id)?;

        if self.storage.exists_terraform_deployment(&id).await? {
            return Err(BrokerError::InstanceAlreadyExists(instance_id.to_string()));
        }

        let workspace = TerraformWorkspace::new(module, configuration);
        let deployment = TerraformDeployment::new(&id, workspace, OperationType::Import);
        self.start(guard, deployment, Action::Import(resources)).await?;
        Ok(id)
    }

    /// Apply a binding and return its outputs.
    #[instrument(skip(self, module, configuration))]
    pub async fn bind(
        &self,
        instance_id: &str,
        binding_id: &str,
        module: ModuleDefinition,
        configuration: Map<String, Value>,
    ) -> Result<Map<String, Value>> {
        let id = deployment_id(instance_id, binding_id);
        let _guard = self.claim(&id)?;

        if let Some(existing) = self.find(&id).await? {
            if existing.last_operation_state != OperationState::Failed {
                return Err(BrokerError::BindingAlreadyExists(binding_id.to_string()));
            }
        }

        let workspace = TerraformWorkspace::new(module, configuration);
        let deployment = TerraformDeployment::new(&id, workspace, OperationType::Bind);
        self.storage.store_terraform_deployment(&deployment).await?;

        let (deployment, failed) = self.complete(deployment, Action::Apply).await?;
        if let Some(e) = failed {
            return Err(engine_failure(e));
        }
        Ok(deployment.workspace.outputs(DEFAULT_INSTANCE_NAME)?)
    }

    /// Destroy a binding and forget it.
    #[instrument(skip(self))]
    pub async fn unbind(&self, instance_id: &str, binding_id: &str) -> Result<()> {
        let id = deployment_id(instance_id, binding_id);
        let _guard = self.claim(&id)?;

        let mut deployment = self
            .find(&id)
            .await?
            .ok_or_else(|| BrokerError::BindingNotFound(binding_id.to_string()))?;
        self.check_version(&deployment.workspace)?;

        deployment.last_operation_type = OperationType::Unbind;
        deployment.last_operation_state = OperationState::InProgress;
        deployment.last_operation_message.clear();
        self.storage.store_terraform_deployment(&deployment).await?;

        let (_, failed) = self.complete(deployment, Action::Destroy).await?;
        if let Some(e) = failed {
            return Err(engine_failure(e));
        }
        self.storage.delete_terraform_deployment(&id).await?;
        Ok(())
    }

    /// Record the operation as in progress and run it in the background.
    async fn start(
        &self,
        guard: InflightGuard,
        mut deployment: TerraformDeployment,
        action: Action,
    ) -> Result<()> {
        deployment.last_operation_state = OperationState::InProgress;
        deployment.last_operation_message.clear();
        self.storage.store_terraform_deployment(&deployment).await?;

        let provider = self.clone();
        self.tasks.spawn(async move {
            let _guard = guard;
            let id = deployment.id.clone();
            if let Err(e) = provider.complete(deployment, action).await {
                error!(deployment_id = %id, "failed to record operation result: {}", e);
            }
        });
        Ok(())
    }

    /// Run `action` and store the outcome on the deployment.
    ///
    /// Engine failures are recorded and handed back next to the stored
    /// deployment; only a failure to store is returned as an error.
    async fn complete(
        &self,
        mut deployment: TerraformDeployment,
        action: Action,
    ) -> Result<(TerraformDeployment, Option<BrokerError>)> {
        let operation = deployment.last_operation_type;
        let (workspace, result) = self.run(deployment.workspace.clone(), action).await;
        if let Some(workspace) = workspace {
            deployment.workspace = workspace;
        }

        let failed = match result {
            Ok(_) => {
                info!(deployment_id = %deployment.id, %operation, "operation succeeded");
                deployment.last_operation_state = OperationState::Succeeded;
                deployment.last_operation_message.clear();
                None
            }
            Err(e) => {
                warn!(deployment_id = %deployment.id, %operation, error = %e, "operation failed");
                deployment.last_operation_state = OperationState::Failed;
                deployment.last_operation_message = e.to_string();
                Some(e)
            }
        };

        self.storage.store_terraform_deployment(&deployment).await?;
        Ok((deployment, failed))
    }

    /// Run the engine off the async runtime. The workspace comes back with
    /// whatever state the engine recorded, unless the blocking task itself
    /// died.
    async fn run(
        &self,
        mut workspace: TerraformWorkspace,
        action: Action,
    ) -> (Option<TerraformWorkspace>, Result<ExecutionOutput>) {
        let invoker = self.invoker.clone();
        let ctx = self.execution_context();

        let joined = tokio::task::spawn_blocking(move || {
            let result = match action {
                Action::Apply => invoker.apply(&ctx, &mut workspace),
                Action::Destroy => invoker.destroy(&ctx, &mut workspace),
                Action::PlanAndApply => invoker
                    .plan(&ctx, &mut workspace)
                    .and_then(|_| invoker.apply(&ctx, &mut workspace)),
                Action::Import(resources) => invoker
                    .import(&ctx, &mut workspace, &resources)
                    .and_then(|_| invoker.plan(&ctx, &mut workspace)),
            };
            (workspace, result)
        })
        .await;

        match joined {
            Ok((workspace, result)) => (Some(workspace), result.map_err(BrokerError::from)),
            Err(e) => (None, Err(BrokerError::Task(e))),
        }
    }

    /// Cancel every running execution and wait for background operations to
    /// record their outcome. New operations are refused afterwards.
    pub async fn shutdown(&self) {
        info!("shutting down, cancelling running operations");
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}

fn engine_failure(err: BrokerError) -> BrokerError {
    match err {
        BrokerError::Workspace(e) if e.is_execution_failure() => BrokerError::EngineExecution(e),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_storage::test_utils::create_test_db;
    use broker_storage::NoopEncryptor;
    use broker_workspace::test_utils::FakeExecutor;
    use serde_json::json;

    const TEMPLATE: &str = "variable \"name\" {}\noutput \"hostname\" { value = var.name }";

    async fn provider(fake: &Arc<FakeExecutor>, version: &str) -> TerraformProvider {
        let storage = Storage::new(create_test_db().await, Arc::new(NoopEncryptor));
        let invoker = Invoker::new(fake.clone(), "/plugins", version.parse().unwrap());
        TerraformProvider::new(storage, invoker, None)
    }

    fn state(version: &str) -> Value {
        json!({
            "version": 4,
            "terraform_version": version,
            "outputs": {"hostname": {"value": "db.internal", "type": "string"}}
        })
    }

    #[test]
    fn test_deployment_id() {
        assert_eq!(deployment_id("abc", ""), "tf:abc:");
        assert_eq!(deployment_id("abc", "def"), "tf:abc:def");
    }

    #[tokio::test]
    async fn test_check_version() {
        let fake = Arc::new(FakeExecutor::new());
        let provider = provider(&fake, "1.1.4").await;

        let mut ws = TerraformWorkspace::new(ModuleDefinition::new("m", TEMPLATE), Map::new());
        assert!(provider.check_version(&ws).is_ok());

        ws.tfstate = Some(state("1.0.0"));
        assert!(provider.check_version(&ws).is_ok());

        ws.tfstate = Some(state("1.1.4"));
        assert!(provider.check_version(&ws).is_ok());

        ws.tfstate = Some(state("1.2.0"));
        let err = provider.check_version(&ws).unwrap_err();
        assert!(matches!(err, BrokerError::VersionIncompatible { .. }));
        assert!(err.to_string().contains("1.2.0"), "{err}");
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let fake = Arc::new(FakeExecutor::new());
        let provider = provider(&fake, "1.1.4").await;

        let guard = provider.claim("tf:a:").unwrap();
        assert!(matches!(
            provider.claim("tf:a:"),
            Err(BrokerError::OperationInProgress(_))
        ));
        assert!(provider.claim("tf:b:").is_ok());
        drop(guard);
        assert!(provider.claim("tf:a:").is_ok());
    }

    #[tokio::test]
    async fn test_bind_and_unbind() {
        let fake = Arc::new(FakeExecutor::new().with_state("apply", state("1.1.4")));
        let provider = provider(&fake, "1.1.4").await;

        let outputs = provider
            .bind(
                "inst",
                "bind-1",
                ModuleDefinition::new("m", TEMPLATE),
                json!({"name": "x"}).as_object().cloned().unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(Value::Object(outputs), json!({"hostname": "db.internal"}));

        let again = provider
            .bind("inst", "bind-1", ModuleDefinition::new("m", TEMPLATE), Map::new())
            .await;
        assert!(matches!(again, Err(BrokerError::BindingAlreadyExists(_))));

        provider.unbind("inst", "bind-1").await.unwrap();
        assert!(provider.status("tf:inst:bind-1").await.unwrap().is_none());
        assert!(matches!(
            provider.unbind("inst", "bind-1").await,
            Err(BrokerError::BindingNotFound(_))
        ));
        assert_eq!(fake.steps(), vec!["init", "apply", "init", "destroy"]);
    }

    #[tokio::test]
    async fn test_failed_bind_is_reported_and_recorded() {
        let fake = Arc::new(FakeExecutor::new().fail_on("apply"));
        let provider = provider(&fake, "1.1.4").await;

        let err = provider
            .bind("inst", "b", ModuleDefinition::new("m", TEMPLATE), Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::EngineExecution(_)));
        assert!(err.to_string().contains("scripted failure"), "{err}");

        let status = provider.status("tf:inst:b").await.unwrap().unwrap();
        assert_eq!(status.state, OperationState::Failed);
        assert_eq!(status.operation, OperationType::Bind);

        // a failed binding may be retried
        fake.set_fail_on(None);
        assert!(provider
            .bind("inst", "b", ModuleDefinition::new("m", TEMPLATE), Map::new())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_refused_after_shutdown() {
        let fake = Arc::new(FakeExecutor::new());
        let provider = provider(&fake, "1.1.4").await;
        provider.shutdown().await;

        let err = provider
            .provision("inst", ModuleDefinition::new("m", TEMPLATE), Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::ShuttingDown));
        assert!(fake.steps().is_empty());
    }
}
