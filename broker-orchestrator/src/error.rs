use broker_storage::StorageError;
use broker_varcontext::{FieldError, VarContextError};
use broker_workspace::{EngineVersion, WorkspaceError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("validation error: {0}")]
    Validation(#[from] FieldError),

    #[error("this service plan requires client support for asynchronous service operations")]
    AsyncRequired,

    #[error("instance does not exist: {0}")]
    InstanceNotFound(String),

    #[error("instance already exists: {0}")]
    InstanceAlreadyExists(String),

    #[error("binding does not exist: {0}")]
    BindingNotFound(String),

    #[error("binding already exists: {0}")]
    BindingAlreadyExists(String),

    #[error("an operation is already in progress for {0}")]
    OperationInProgress(String),

    #[error(
        "state was written by terraform {state}, newer than the configured {configured}; \
         upgrade the broker's terraform before retrying the operation"
    )]
    VersionIncompatible {
        state: EngineVersion,
        configured: EngineVersion,
    },

    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("plan {plan_id} not found for service {service_id}")]
    PlanNotFound { service_id: String, plan_id: String },

    #[error("broker is shutting down")]
    ShuttingDown,

    #[error("terraform execution failed: {0}")]
    EngineExecution(#[source] WorkspaceError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Variables(#[from] VarContextError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid service definition: {0}")]
    Definition(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
