//! The service broker: catalog lookups, parameter handling and instance
//! bookkeeping around the engine provider.

use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result};
use crate::params::{
    check_prohibited_updates, module_configuration, parse_parameters, resolve_variables,
    validate_user_parameters, RequestContext,
};
use crate::provider::{deployment_id, TerraformProvider};
use crate::service::{ServiceAction, ServiceDefinition, ServicePlan, ServiceRegistry};
use broker_storage::db::{backup_database, create_pool, run_migrations};
use broker_storage::{
    setup_encryptor, OperationState, OperationType, ServiceInstanceDetails, Storage, StorageError,
};
use broker_varcontext::FieldError;
use broker_workspace::{BinaryExecutor, DefaultExecutor, EngineExecutor, Invoker};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProvisionDetails {
    pub service_id: String,
    pub plan_id: String,
    pub organization_guid: String,
    pub space_guid: String,
    /// Raw JSON parameters as sent by the client.
    pub raw_parameters: Vec<u8>,
    pub originating_identity: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateDetails {
    pub service_id: String,
    /// New plan; empty keeps the current one.
    pub plan_id: String,
    pub raw_parameters: Vec<u8>,
    pub originating_identity: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeprovisionDetails {
    pub service_id: String,
    pub plan_id: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BindDetails {
    pub service_id: String,
    pub plan_id: String,
    pub app_guid: Option<String>,
    pub raw_parameters: Vec<u8>,
    pub originating_identity: Map<String, Value>,
}

/// Progress of the last asynchronous operation on an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastOperation {
    pub finished: bool,
    pub state: OperationState,
    pub message: String,
}

impl LastOperation {
    fn succeeded() -> Self {
        Self {
            finished: true,
            state: OperationState::Succeeded,
            message: String::new(),
        }
    }
}

pub struct ServiceBroker {
    registry: ServiceRegistry,
    provider: TerraformProvider,
    broker_config: Map<String, Value>,
}

fn not_found_as(err: StorageError, instance_id: &str) -> BrokerError {
    if err.is_not_found() {
        BrokerError::InstanceNotFound(instance_id.to_string())
    } else {
        BrokerError::Storage(err)
    }
}

impl ServiceBroker {
    pub fn new(
        registry: ServiceRegistry,
        provider: TerraformProvider,
        broker_config: Map<String, Value>,
    ) -> Self {
        Self {
            registry,
            provider,
            broker_config,
        }
    }

    /// Open the database, set up encryption and load the service catalog.
    #[instrument(skip_all, fields(db_path = %config.db_path.display()))]
    pub async fn from_config(config: &BrokerConfig) -> Result<Self> {
        let version = config.engine_version()?;

        if let Some(backup) = backup_database(&config.db_path)? {
            info!(backup = %backup.display(), "backed up database");
        }
        let pool = create_pool(&config.db_path).await?;
        run_migrations(&pool).await?;

        let encryptor =
            setup_encryptor(&pool, config.encryption_enabled, &config.encryption_passwords).await?;
        let storage = Storage::new(pool, encryptor);

        let executor: Arc<dyn EngineExecutor> = Arc::new(BinaryExecutor::new(
            &config.terraform_binary,
            DefaultExecutor,
        ));
        let invoker = Invoker::new(executor, &config.plugin_dir, version);
        let provider = TerraformProvider::new(storage, invoker, config.operation_timeout());

        let mut registry = ServiceRegistry::new();
        if let Some(dir) = &config.services_dir {
            registry.load_dir(dir)?;
        }
        info!(services = registry.len(), terraform = %version, "broker ready");

        Ok(Self::new(registry, provider, config.brokerpak_config.clone()))
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn provider(&self) -> &TerraformProvider {
        &self.provider
    }

    fn storage(&self) -> &Storage {
        self.provider.storage()
    }

    fn lookup(&self, service_id: &str, plan_id: &str) -> Result<(&ServiceDefinition, &ServicePlan)> {
        let service = self.registry.get(service_id)?;
        let plan = service.plan(plan_id)?;
        Ok((service, plan))
    }

    async fn instance(&self, instance_id: &str) -> Result<ServiceInstanceDetails> {
        self.storage()
            .get_service_instance_details(instance_id)
            .await
            .map_err(|e| not_found_as(e, instance_id))
    }

    /// Parameters recorded at provision time, empty when none were stored.
    async fn provisioned_parameters(&self, instance_id: &str) -> Result<Map<String, Value>> {
        match self.storage().get_provision_request_details(instance_id).await {
            Ok(params) => Ok(params),
            Err(e) if e.is_not_found() => Ok(Map::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn configuration(
        &self,
        action: &ServiceAction,
        plan: &ServicePlan,
        constants: &Map<String, Value>,
        params: &Map<String, Value>,
    ) -> Result<Map<String, Value>> {
        let vc = resolve_variables(action, plan, constants, &self.broker_config, params)?;
        Ok(module_configuration(&action.module(), &vc))
    }

    /// Start provisioning an instance. Returns the operation id to poll.
    #[instrument(skip(self, details), fields(service_id = %details.service_id, plan_id = %details.plan_id))]
    pub async fn provision(
        &self,
        instance_id: &str,
        details: ProvisionDetails,
        accepts_incomplete: bool,
    ) -> Result<String> {
        if !accepts_incomplete {
            return Err(BrokerError::AsyncRequired);
        }
        let (service, plan) = self.lookup(&details.service_id, &details.plan_id)?;

        if self.storage().exists_service_instance_details(instance_id).await? {
            let status = self
                .provider
                .status(&deployment_id(instance_id, ""))
                .await?;
            match status {
                Some(s) if s.state == OperationState::InProgress => {
                    return Err(BrokerError::OperationInProgress(instance_id.to_string()))
                }
                Some(s)
                    if s.state == OperationState::Failed
                        && s.operation == OperationType::Provision => {}
                _ => return Err(BrokerError::InstanceAlreadyExists(instance_id.to_string())),
            }
        }

        let params = parse_parameters(&details.raw_parameters)?;
        validate_user_parameters(&service.provision, &params)?;

        let constants = RequestContext::new(instance_id, &service.id, &plan.id)
            .with_identity(details.originating_identity.clone())
            .constants(plan);
        let configuration = self.configuration(&service.provision, plan, &constants, &params)?;

        let operation_id = self
            .provider
            .provision(instance_id, service.provision.module(), configuration)
            .await?;

        self.storage()
            .store_provision_request_details(instance_id, &params)
            .await?;
        self.storage()
            .store_service_instance_details(&ServiceInstanceDetails {
                id: instance_id.to_string(),
                name: service.name.clone(),
                service_id: service.id.clone(),
                plan_id: plan.id.clone(),
                space_guid: details.space_guid,
                organization_guid: details.organization_guid,
                operation_type: OperationType::Provision.to_string(),
                operation_id: operation_id.clone(),
                outputs: Map::new(),
            })
            .await?;

        info!(operation_id = %operation_id, "provision started");
        Ok(operation_id)
    }

    /// Start updating an instance's parameters or plan.
    #[instrument(skip(self, details))]
    pub async fn update(
        &self,
        instance_id: &str,
        details: UpdateDetails,
        accepts_incomplete: bool,
    ) -> Result<String> {
        if !accepts_incomplete {
            return Err(BrokerError::AsyncRequired);
        }
        let mut instance = self.instance(instance_id).await?;
        let plan_id = if details.plan_id.is_empty() {
            instance.plan_id.clone()
        } else {
            details.plan_id.clone()
        };
        let (service, plan) = self.lookup(&instance.service_id, &plan_id)?;

        let params = parse_parameters(&details.raw_parameters)?;
        validate_user_parameters(&service.provision, &params)?;
        let mut merged = self.provisioned_parameters(instance_id).await?;
        check_prohibited_updates(&service.provision, &merged, &params)?;
        merged.extend(params);

        let constants = RequestContext::new(instance_id, &service.id, &plan.id)
            .with_identity(details.originating_identity.clone())
            .constants(plan);
        let configuration = self.configuration(&service.provision, plan, &constants, &merged)?;

        let operation_id = self.provider.update(instance_id, configuration).await?;

        self.storage()
            .store_provision_request_details(instance_id, &merged)
            .await?;
        instance.plan_id = plan.id.clone();
        instance.operation_type = OperationType::Update.to_string();
        instance.operation_id = operation_id.clone();
        self.storage().store_service_instance_details(&instance).await?;

        Ok(operation_id)
    }

    /// Destroy an instance.
    ///
    /// Returns `None` when the instance was removed synchronously, otherwise
    /// the operation id to poll. Records are only removed once the destroy
    /// is seen to succeed.
    #[instrument(skip(self, details))]
    pub async fn deprovision(
        &self,
        instance_id: &str,
        details: DeprovisionDetails,
        accepts_incomplete: bool,
    ) -> Result<Option<String>> {
        if !accepts_incomplete {
            return Err(BrokerError::AsyncRequired);
        }
        let mut instance = self.instance(instance_id).await?;

        let tf_id = deployment_id(instance_id, "");
        if self.storage().exists_terraform_deployment(&tf_id).await? {
            self.provider.check_upgrade_available(&tf_id).await?;
        }

        let plan_id = if details.plan_id.is_empty() {
            instance.plan_id.clone()
        } else {
            details.plan_id
        };
        let (service, plan) = self.lookup(&instance.service_id, &plan_id)?;
        let params = self.provisioned_parameters(instance_id).await?;
        let constants = RequestContext::new(instance_id, &service.id, &plan.id).constants(plan);
        let configuration = self.configuration(&service.provision, plan, &constants, &params)?;

        match self.provider.deprovision(instance_id, configuration).await? {
            None => {
                self.storage().delete_instance_records(instance_id).await?;
                info!("instance removed");
                Ok(None)
            }
            Some(operation_id) => {
                instance.operation_type = OperationType::Deprovision.to_string();
                instance.operation_id = operation_id.clone();
                self.storage().store_service_instance_details(&instance).await?;
                Ok(Some(operation_id))
            }
        }
    }

    /// Report the last operation on an instance, settling finished ones.
    ///
    /// A successful provision, update or import copies the outputs onto the
    /// instance; a successful deprovision removes the instance.
    #[instrument(skip(self))]
    pub async fn last_operation(&self, instance_id: &str) -> Result<LastOperation> {
        let mut instance = self.instance(instance_id).await?;
        let tf_id = deployment_id(instance_id, "");

        let Some(status) = self.provider.status(&tf_id).await? else {
            if instance.operation_type == OperationType::Deprovision.to_string() {
                self.storage().delete_instance_records(instance_id).await?;
                return Ok(LastOperation::succeeded());
            }
            return Err(BrokerError::InstanceNotFound(instance_id.to_string()));
        };

        let last = LastOperation {
            finished: status.state.is_finished(),
            state: status.state,
            message: status.message,
        };
        if last.state != OperationState::Succeeded {
            return Ok(last);
        }

        match status.operation {
            OperationType::Deprovision => {
                self.storage().delete_instance_records(instance_id).await?;
                self.provider.delete_deployment(&tf_id).await?;
                info!("deprovision finished, instance removed");
            }
            OperationType::Provision | OperationType::Update | OperationType::Import => {
                instance.outputs = self.provider.outputs(&tf_id).await?;
                instance.operation_type.clear();
                instance.operation_id.clear();
                self.storage().store_service_instance_details(&instance).await?;
            }
            OperationType::Bind | OperationType::Unbind => {
                warn!(operation = %status.operation, "unexpected operation on instance deployment");
            }
        }
        Ok(last)
    }

    /// Start adopting existing resources as a new instance.
    ///
    /// Each import input names a request parameter holding the id of the
    /// resource to adopt at its `tf_resource` address.
    #[instrument(skip(self, details), fields(service_id = %details.service_id))]
    pub async fn import(
        &self,
        instance_id: &str,
        details: ProvisionDetails,
        accepts_incomplete: bool,
    ) -> Result<String> {
        if !accepts_incomplete {
            return Err(BrokerError::AsyncRequired);
        }
        let (service, plan) = self.lookup(&details.service_id, &details.plan_id)?;
        if self.storage().exists_service_instance_details(instance_id).await? {
            return Err(BrokerError::InstanceAlreadyExists(instance_id.to_string()));
        }

        let params = parse_parameters(&details.raw_parameters)?;
        validate_user_parameters(&service.provision, &params)?;

        let mut resources = BTreeMap::new();
        let mut missing = Vec::new();
        for input in &service.provision.import_inputs {
            match params.get(&input.field_name).and_then(Value::as_str) {
                Some(id) if !id.is_empty() => {
                    resources.insert(input.tf_resource.clone(), id.to_string());
                }
                _ => missing.push(input.field_name.as_str()),
            }
        }
        if !missing.is_empty() {
            return Err(FieldError::missing(&missing).into());
        }

        let constants = RequestContext::new(instance_id, &service.id, &plan.id)
            .with_identity(details.originating_identity.clone())
            .constants(plan);
        let configuration = self.configuration(&service.provision, plan, &constants, &params)?;

        let operation_id = self
            .provider
            .import(instance_id, service.provision.module(), configuration, resources)
            .await?;

        self.storage()
            .store_provision_request_details(instance_id, &params)
            .await?;
        self.storage()
            .store_service_instance_details(&ServiceInstanceDetails {
                id: instance_id.to_string(),
                name: service.name.clone(),
                service_id: service.id.clone(),
                plan_id: plan.id.clone(),
                space_guid: details.space_guid,
                organization_guid: details.organization_guid,
                operation_type: OperationType::Import.to_string(),
                operation_id: operation_id.clone(),
                outputs: Map::new(),
            })
            .await?;

        Ok(operation_id)
    }

    /// Create a binding and return its credentials.
    #[instrument(skip(self, details))]
    pub async fn bind(
        &self,
        instance_id: &str,
        binding_id: &str,
        details: BindDetails,
    ) -> Result<Map<String, Value>> {
        let instance = self.instance(instance_id).await?;
        let (service, plan) = self.lookup(&instance.service_id, &instance.plan_id)?;

        let params = parse_parameters(&details.raw_parameters)?;
        validate_user_parameters(&service.bind, &params)?;

        let mut constants = RequestContext::new(instance_id, &service.id, &plan.id)
            .with_identity(details.originating_identity.clone())
            .for_binding(binding_id, details.app_guid.clone())
            .constants(plan);
        constants.insert(
            "instance".into(),
            json!({"name": instance.name, "details": instance.outputs}),
        );
        let configuration = self.configuration(&service.bind, plan, &constants, &params)?;

        self.provider
            .bind(instance_id, binding_id, service.bind.module(), configuration)
            .await
    }

    #[instrument(skip(self))]
    pub async fn unbind(&self, instance_id: &str, binding_id: &str) -> Result<()> {
        if !self.storage().exists_service_instance_details(instance_id).await? {
            return Err(BrokerError::InstanceNotFound(instance_id.to_string()));
        }
        self.provider.unbind(instance_id, binding_id).await
    }

    /// Cancel running operations and wait for them to record their outcome.
    pub async fn shutdown(&self) {
        self.provider.shutdown().await;
    }
}
