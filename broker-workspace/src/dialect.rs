use crate::command::Command;
use crate::error::Result;
use crate::executor::{EngineExecutor, ExecutionContext, ExecutionOutput};
use crate::version::EngineVersion;
use crate::workspace::TerraformWorkspace;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, instrument};

/// First engine release using the current `init` flags.
pub const TERRAFORM_013: EngineVersion = EngineVersion::new(0, 13, 0);

/// Version-specific command composition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Terraform012,
    Terraform013,
}

impl Dialect {
    pub fn for_version(version: EngineVersion) -> Self {
        if version < TERRAFORM_013 {
            Dialect::Terraform012
        } else {
            Dialect::Terraform013
        }
    }

    pub fn init(&self, plugin_dir: impl Into<PathBuf>) -> Command {
        match self {
            Dialect::Terraform012 => Command::init_012(plugin_dir),
            Dialect::Terraform013 => Command::init(plugin_dir),
        }
    }
}

/// Runs logical actions against a workspace with the dialect its state calls for.
#[derive(Clone)]
pub struct Invoker {
    executor: Arc<dyn EngineExecutor>,
    plugin_dir: PathBuf,
    default_version: EngineVersion,
}

impl Invoker {
    pub fn new(
        executor: Arc<dyn EngineExecutor>,
        plugin_dir: impl Into<PathBuf>,
        default_version: EngineVersion,
    ) -> Self {
        Self {
            executor,
            plugin_dir: plugin_dir.into(),
            default_version,
        }
    }

    pub fn default_version(&self) -> EngineVersion {
        self.default_version
    }

    /// The dialect for the workspace's recorded engine version, or for the
    /// configured default when nothing has been recorded yet.
    pub fn dialect_for(&self, workspace: &TerraformWorkspace) -> Result<Dialect> {
        let version = workspace.state_version()?.unwrap_or(self.default_version);
        Ok(Dialect::for_version(version))
    }

    fn with_init(&self, workspace: &TerraformWorkspace, action: Command) -> Result<Vec<Command>> {
        let dialect = self.dialect_for(workspace)?;
        Ok(vec![dialect.init(&self.plugin_dir), action])
    }

    #[instrument(skip_all)]
    pub fn apply(
        &self,
        ctx: &ExecutionContext,
        workspace: &mut TerraformWorkspace,
    ) -> Result<ExecutionOutput> {
        let commands = self.with_init(workspace, Command::Apply)?;
        workspace.execute(ctx, self.executor.as_ref(), &commands)
    }

    #[instrument(skip_all)]
    pub fn destroy(
        &self,
        ctx: &ExecutionContext,
        workspace: &mut TerraformWorkspace,
    ) -> Result<ExecutionOutput> {
        let commands = self.with_init(workspace, Command::Destroy)?;
        workspace.execute(ctx, self.executor.as_ref(), &commands)
    }

    #[instrument(skip_all)]
    pub fn plan(
        &self,
        ctx: &ExecutionContext,
        workspace: &mut TerraformWorkspace,
    ) -> Result<ExecutionOutput> {
        let commands = self.with_init(workspace, Command::Plan)?;
        workspace.execute(ctx, self.executor.as_ref(), &commands)
    }

    #[instrument(skip_all)]
    pub fn show(&self, ctx: &ExecutionContext, workspace: &mut TerraformWorkspace) -> Result<String> {
        let commands = self.with_init(workspace, Command::Show)?;
        workspace
            .execute(ctx, self.executor.as_ref(), &commands)
            .map(|output| output.stdout)
    }

    /// Import each `address -> id` pair, in address order.
    #[instrument(skip_all, fields(resources = resources.len()))]
    pub fn import(
        &self,
        ctx: &ExecutionContext,
        workspace: &mut TerraformWorkspace,
        resources: &BTreeMap<String, String>,
    ) -> Result<ExecutionOutput> {
        let dialect = self.dialect_for(workspace)?;
        let mut commands = vec![dialect.init(&self.plugin_dir)];
        for (address, id) in resources {
            info!(address = %address, id = %id, "importing resource");
            commands.push(Command::import(address, id));
        }
        workspace.execute(ctx, self.executor.as_ref(), &commands)
    }
}
