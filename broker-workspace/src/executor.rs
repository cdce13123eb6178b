//! Running the engine binary.
//!
//! Executors are blocking: a call returns once the process exits, is killed
//! for exceeding its timeout, or is killed because its cancellation token
//! fired. Async callers run them on the blocking pool.

use crate::error::{Result, WorkspaceError};
use duct::cmd;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A fully resolved engine process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub dir: PathBuf,
    pub env: Vec<(String, String)>,
}

impl Invocation {
    pub fn new(args: Vec<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            program: "terraform".to_string(),
            args,
            dir: dir.into(),
            env: Vec::new(),
        }
    }

    /// The engine sub-command, e.g. `apply`.
    pub fn step(&self) -> &str {
        self.args.first().map(String::as_str).unwrap_or_default()
    }

    fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Cancellation and timeout boundary for one operation.
///
/// The timeout covers every command run with the same context: the deadline
/// is fixed when the timeout is set, not when each process starts.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    pub cancel: CancellationToken,
    timeout: Option<(Duration, Instant)>,
}

impl ExecutionContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some((timeout, Instant::now() + timeout));
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.map(|(timeout, _)| timeout)
    }

    /// The configured timeout, if the deadline has passed.
    pub fn expired(&self) -> Option<Duration> {
        self.timeout
            .filter(|(_, deadline)| Instant::now() >= *deadline)
            .map(|(timeout, _)| timeout)
    }
}

pub trait EngineExecutor: Send + Sync {
    fn execute(&self, ctx: &ExecutionContext, invocation: Invocation) -> Result<ExecutionOutput>;
}

impl<T: EngineExecutor + ?Sized> EngineExecutor for Arc<T> {
    fn execute(&self, ctx: &ExecutionContext, invocation: Invocation) -> Result<ExecutionOutput> {
        (**self).execute(ctx, invocation)
    }
}

/// Spawns the engine as a child process and waits for it.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultExecutor;

impl EngineExecutor for DefaultExecutor {
    fn execute(&self, ctx: &ExecutionContext, invocation: Invocation) -> Result<ExecutionOutput> {
        let step = invocation.step().to_string();
        debug!(step = %step, dir = %invocation.dir.display(), "running {}", invocation.command_line());
        if let Some(timeout) = ctx.expired() {
            return Err(WorkspaceError::Timeout { step, timeout });
        }

        let mut expression = cmd(invocation.program.as_str(), &invocation.args).dir(&invocation.dir);
        for (key, value) in &invocation.env {
            expression = expression.env(key, value);
        }

        let handle = expression
            .stdout_capture()
            .stderr_capture()
            .unchecked()
            .start()
            .map_err(|source| WorkspaceError::Spawn {
                program: invocation.program.clone(),
                source,
            })?;

        loop {
            if ctx.cancel.is_cancelled() {
                if let Err(e) = handle.kill() {
                    warn!(step = %step, "failed to kill cancelled process: {}", e);
                }
                return Err(WorkspaceError::Cancelled { step });
            }

            if let Some(timeout) = ctx.expired() {
                if let Err(e) = handle.kill() {
                    warn!(step = %step, "failed to kill timed out process: {}", e);
                }
                return Err(WorkspaceError::Timeout { step, timeout });
            }

            match handle.try_wait()? {
                Some(output) => {
                    let result = ExecutionOutput {
                        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    };
                    for line in result.stdout.lines() {
                        debug!(step = %step, "{}", line);
                    }

                    if !output.status.success() {
                        let status = output
                            .status
                            .code()
                            .map(|c| format!("exit code {c}"))
                            .unwrap_or_else(|| "a signal".to_string());
                        return Err(WorkspaceError::StepFailed {
                            step,
                            status,
                            stdout: result.stdout,
                            stderr: result.stderr,
                        });
                    }
                    return Ok(result);
                }
                None => thread::sleep(POLL_INTERVAL),
            }
        }
    }
}

/// Runs a specific engine binary instead of the one on `PATH`.
pub struct BinaryExecutor<E> {
    binary: PathBuf,
    inner: E,
}

impl<E: EngineExecutor> BinaryExecutor<E> {
    pub fn new(binary: impl Into<PathBuf>, inner: E) -> Self {
        Self {
            binary: binary.into(),
            inner,
        }
    }
}

impl<E: EngineExecutor> EngineExecutor for BinaryExecutor<E> {
    fn execute(&self, ctx: &ExecutionContext, mut invocation: Invocation) -> Result<ExecutionOutput> {
        invocation.program = self.binary.to_string_lossy().into_owned();
        self.inner.execute(ctx, invocation)
    }
}

/// Adds environment variables to every invocation.
pub struct EnvironmentExecutor<E> {
    env: Vec<(String, String)>,
    inner: E,
}

impl<E: EngineExecutor> EnvironmentExecutor<E> {
    pub fn new<I, K, V>(env: I, inner: E) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            env: env.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
            inner,
        }
    }
}

impl<E: EngineExecutor> EngineExecutor for EnvironmentExecutor<E> {
    fn execute(&self, ctx: &ExecutionContext, mut invocation: Invocation) -> Result<ExecutionOutput> {
        invocation.env.extend(self.env.iter().cloned());
        self.inner.execute(ctx, invocation)
    }
}
