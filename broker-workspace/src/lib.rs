//! Engine workspaces and the commands run against them.
//!
//! A [`TerraformWorkspace`] holds the module sources, their instance
//! configuration and the recorded engine state for one deployment. It is
//! only mutated through [`TerraformWorkspace::execute`], which materialises
//! everything into a scratch directory, runs an ordered list of
//! [`Command`]s through an [`EngineExecutor`] and reads the state back.
//!
//! [`Invoker`] picks the [`Dialect`] matching the workspace's recorded engine
//! version and composes the command list for each logical action.

pub mod command;
pub mod dialect;
pub mod error;
pub mod executor;
pub mod version;
pub mod workspace;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use command::Command;
pub use dialect::{Dialect, Invoker};
pub use error::{Result, WorkspaceError};
pub use executor::{
    BinaryExecutor, DefaultExecutor, EngineExecutor, EnvironmentExecutor, ExecutionContext,
    ExecutionOutput, Invocation,
};
pub use version::EngineVersion;
pub use workspace::{
    ModuleDefinition, ModuleInstance, TerraformWorkspace, DEFAULT_INSTANCE_NAME, DEFAULT_MODULE_NAME,
};
