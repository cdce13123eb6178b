//! Operation orchestration for the service broker.
//!
//! [`ServiceBroker`] validates requests against the service catalog,
//! resolves variables and keeps instance records. [`TerraformProvider`]
//! owns the deployments and runs the engine, asynchronously for instance
//! operations and synchronously for bindings.

pub mod broker;
pub mod config;
pub mod error;
pub mod params;
pub mod provider;
pub mod service;

pub use broker::{
    BindDetails, DeprovisionDetails, LastOperation, ProvisionDetails, ServiceBroker,
    UpdateDetails,
};
pub use config::BrokerConfig;
pub use error::{BrokerError, Result};
pub use params::RequestContext;
pub use provider::{deployment_id, Action, OperationStatus, TerraformProvider};
pub use service::{
    BrokerVariable, ImportVariable, JsonType, ServiceAction, ServiceDefinition, ServicePlan,
    ServiceRegistry,
};
