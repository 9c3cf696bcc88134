//! External command execution.
//!
//! Provisioning and host queries shell out to tools like `virt-install`,
//! `virt-clone` and `ip`. They go through [`CommandRunner`] so tests can
//! script exit codes, output and timeouts without touching the host.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::error::{HypervisorError, Result};

/// A command to run with a bounded wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Value of a `--key=value` argument.
    pub fn flag_value(&self, key: &str) -> Option<&str> {
        let prefix = format!("--{}=", key);
        self.args.iter().find_map(|a| a.strip_prefix(prefix.as_str()))
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.args.iter().any(|a| a == flag)
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs external commands.
///
/// Implementations must return `Timeout` when `spec.timeout` expires. The
/// child process may be left running; only the wait is abandoned.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, spec: CommandSpec) -> Result<CommandOutput>;
}

/// Runs commands on the host with `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioCommandRunner;

impl TokioCommandRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, spec: CommandSpec) -> Result<CommandOutput> {
        let start = Instant::now();
        debug!(program = %spec.program, args = ?spec.args, "Running command");

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let child = cmd.spawn().map_err(|e| {
            error!(error = %e, program = %spec.program, "Failed to spawn command");
            HypervisorError::ProvisioningFailed {
                tool: spec.program.clone(),
                detail: format!("failed to start: {}", e),
            }
        })?;

        match tokio::time::timeout(spec.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let exit_code = output.status.code().unwrap_or(-1);
                info!(
                    program = %spec.program,
                    exit_code = exit_code,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Command completed"
                );
                Ok(CommandOutput {
                    exit_code,
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                })
            }
            Ok(Err(e)) => Err(HypervisorError::ProvisioningFailed {
                tool: spec.program.clone(),
                detail: format!("execution error: {}", e),
            }),
            Err(_) => {
                warn!(
                    program = %spec.program,
                    timeout_secs = spec.timeout.as_secs(),
                    "Command timed out, leaving it running"
                );
                Err(HypervisorError::Timeout {
                    operation: spec.program.clone(),
                    after: spec.timeout,
                })
            }
        }
    }
}
