use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, WorkspaceError>;

#[derive(Error, Debug)]
pub enum WorkspaceError {
    #[error("terraform {step} failed with {status}: {stderr}")]
    StepFailed {
        step: String,
        status: String,
        stdout: String,
        stderr: String,
    },

    #[error("terraform {step} timed out after {}s", timeout.as_secs())]
    Timeout { step: String, timeout: Duration },

    #[error("terraform {step} was cancelled")]
    Cancelled { step: String },

    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("module {0:?} is not defined in the workspace")]
    ModuleNotFound(String),

    #[error("invalid terraform version {0:?}")]
    InvalidVersion(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl WorkspaceError {
    /// True for failures of the engine itself rather than of the workspace plumbing.
    pub fn is_execution_failure(&self) -> bool {
        matches!(
            self,
            WorkspaceError::StepFailed { .. }
                | WorkspaceError::Timeout { .. }
                | WorkspaceError::Cancelled { .. }
        )
    }
}
