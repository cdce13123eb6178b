use crate::error::{Result, WorkspaceError};
use crate::executor::{EngineExecutor, ExecutionContext, ExecutionOutput, Invocation};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

#[derive(Default)]
struct Script {
    states: HashMap<String, Value>,
    stdout: HashMap<String, String>,
    fail_on: Option<String>,
    hang_on: Option<String>,
    invocations: Vec<Invocation>,
    files: Vec<String>,
}

/// Scripted stand-in for the engine binary.
///
/// Records every invocation, can write a state file or fail on a named step,
/// and can block on a step until the execution is cancelled or times out.
#[derive(Default)]
pub struct FakeExecutor {
    script: Mutex<Script>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Write `state` as the engine state file whenever `step` runs.
    pub fn with_state(self, step: &str, state: Value) -> Self {
        self.set_state(step, state);
        self
    }

    pub fn with_stdout(self, step: &str, stdout: &str) -> Self {
        self.script().stdout.insert(step.to_string(), stdout.to_string());
        self
    }

    pub fn fail_on(self, step: &str) -> Self {
        self.set_fail_on(Some(step));
        self
    }

    pub fn hang_on(self, step: &str) -> Self {
        self.script().hang_on = Some(step.to_string());
        self
    }

    pub fn set_state(&self, step: &str, state: Value) {
        self.script().states.insert(step.to_string(), state);
    }

    pub fn set_fail_on(&self, step: Option<&str>) {
        self.script().fail_on = step.map(str::to_string);
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.script().invocations.clone()
    }

    /// Sub-commands run so far, in order.
    pub fn steps(&self) -> Vec<String> {
        self.script()
            .invocations
            .iter()
            .map(|i| i.step().to_string())
            .collect()
    }

    /// Relative paths of every file present in the working directory across all invocations.
    pub fn seen_files(&self) -> Vec<String> {
        self.script().files.clone()
    }
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<String>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, out);
        } else if let Ok(relative) = path.strip_prefix(root) {
            let name = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            if !out.contains(&name) {
                out.push(name);
            }
        }
    }
}

impl EngineExecutor for FakeExecutor {
    fn execute(&self, ctx: &ExecutionContext, invocation: Invocation) -> Result<ExecutionOutput> {
        let step = invocation.step().to_string();
        let (state, stdout, fail, hang) = {
            let mut script = self.script();
            let mut files = std::mem::take(&mut script.files);
            collect_files(&invocation.dir, &invocation.dir, &mut files);
            script.files = files;
            script.invocations.push(invocation.clone());
            (
                script.states.get(&step).cloned(),
                script.stdout.get(&step).cloned().unwrap_or_default(),
                script.fail_on.as_deref() == Some(step.as_str()),
                script.hang_on.as_deref() == Some(step.as_str()),
            )
        };

        if hang {
            loop {
                if ctx.cancel.is_cancelled() {
                    return Err(WorkspaceError::Cancelled { step });
                }
                if let Some(timeout) = ctx.expired() {
                    return Err(WorkspaceError::Timeout { step, timeout });
                }
                thread::sleep(Duration::from_millis(10));
            }
        }

        if let Some(state) = state {
            std::fs::write(
                invocation.dir.join("terraform.tfstate"),
                serde_json::to_vec(&state)?,
            )?;
        }

        if fail {
            return Err(WorkspaceError::StepFailed {
                step,
                status: "exit code 1".to_string(),
                stdout,
                stderr: "scripted failure".to_string(),
            });
        }

        Ok(ExecutionOutput {
            stdout,
            stderr: String::new(),
        })
    }
}
