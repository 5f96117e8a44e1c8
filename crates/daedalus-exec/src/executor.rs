//! Agent executor trait and the shell-based implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::{ExecError, ExecResult};

/// Stderr is diagnostic-only; anything past this is noise.
const STDERR_CAP: u64 = 1024 * 1024;

/// Executor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Command to execute
    pub command: String,
    /// Default arguments prepended before the prompt
    #[serde(default)]
    pub default_args: Vec<String>,
    /// Environment variables (values may reference `${VAR}`)
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory for the agent process
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    /// Hard deadline in seconds
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    /// Output ceiling in megabytes
    #[serde(default = "default_max_output_mb")]
    pub max_output_mb: u64,
}

fn default_timeout() -> u64 {
    300
}

fn default_max_output_mb() -> u64 {
    100
}

impl ExecutorConfig {
    /// Create a config for an arbitrary command.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            default_args: Vec::new(),
            env: HashMap::new(),
            workdir: None,
            timeout_seconds: default_timeout(),
            max_output_mb: default_max_output_mb(),
        }
    }

    /// Create a Claude CLI config.
    pub fn claude() -> Self {
        Self {
            command: "claude".to_string(),
            default_args: vec!["--print".to_string()],
            env: HashMap::new(),
            workdir: None,
            timeout_seconds: 300,
            max_output_mb: default_max_output_mb(),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::claude()
    }
}

/// Boundary to the external reasoning agent.
///
/// Implementations must be total: every failure mode (spawn error,
/// non-zero exit, timeout, oversized output) comes back as an `Err`.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// Executor name, for logs.
    fn name(&self) -> &str;

    /// Run the agent with a role-specific prompt and return its raw
    /// stdout. `role` is advisory context (exported to the process).
    async fn execute(&self, role: &str, prompt: &str) -> ExecResult<String>;

    /// Whether the underlying command exists on this machine.
    async fn is_available(&self) -> bool;
}

/// Shell-based executor: one agent CLI process per invocation.
pub struct ShellExecutor {
    config: ExecutorConfig,
}

impl ShellExecutor {
    /// Create a new shell executor.
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl AgentExecutor for ShellExecutor {
    fn name(&self) -> &str {
        &self.config.command
    }

    async fn execute(&self, role: &str, prompt: &str) -> ExecResult<String> {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.default_args);
        cmd.arg(prompt);
        cmd.env("DAEDALUS_ROLE", role);

        for (key, value) in &self.config.env {
            // Expand ${VAR} references
            let expanded = if value.starts_with("${") && value.ends_with('}') {
                let var_name = &value[2..value.len() - 1];
                std::env::var(var_name).unwrap_or_default()
            } else {
                value.clone()
            };
            cmd.env(key, expanded);
        }

        if let Some(workdir) = &self.config.workdir {
            cmd.current_dir(workdir);
        }

        debug!(command = %self.config.command, role = %role, "Executing agent");

        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        // Dropping the run future on timeout (or an early error return)
        // must take the child with it, or every timed-out engagement
        // leaks a detached process.
        cmd.kill_on_drop(true);

        let limit = self.config.max_output_mb as usize * 1024 * 1024;
        let limit_mb = self.config.max_output_mb;
        let timeout = Duration::from_secs(self.config.timeout_seconds);

        let run = async move {
            let mut child = cmd
                .spawn()
                .map_err(|e| ExecError::ExecutionFailed(e.to_string()))?;
            let stdout_pipe = child
                .stdout
                .take()
                .ok_or_else(|| ExecError::ExecutionFailed("stdout not captured".into()))?;
            let stderr_pipe = child
                .stderr
                .take()
                .ok_or_else(|| ExecError::ExecutionFailed("stderr not captured".into()))?;

            // Drain stderr on its own task so a chatty child cannot
            // wedge on a full stderr pipe while we read stdout. Past
            // the cap the rest is discarded, not buffered.
            let stderr_task = tokio::spawn(async move {
                let mut stderr = Vec::new();
                let mut capped = stderr_pipe.take(STDERR_CAP);
                let _ = capped.read_to_end(&mut stderr).await;
                let _ = tokio::io::copy(&mut capped.into_inner(), &mut tokio::io::sink()).await;
                stderr
            });

            // Buffer stdout only one byte past the ceiling.
            let mut stdout = Vec::new();
            let mut capped_out = stdout_pipe.take(limit as u64 + 1);
            capped_out
                .read_to_end(&mut stdout)
                .await
                .map_err(|e| ExecError::ExecutionFailed(e.to_string()))?;

            // Bail before wait(): an over-limit child may still be
            // writing into a full pipe and would never exit on its own.
            if stdout.len() > limit {
                return Err(ExecError::OutputTooLarge {
                    size: stdout.len(),
                    limit_mb,
                });
            }

            let status = child
                .wait()
                .await
                .map_err(|e| ExecError::ExecutionFailed(e.to_string()))?;
            let stderr = stderr_task.await.unwrap_or_default();
            if !status.success() {
                return Err(ExecError::ExecutionFailed(
                    String::from_utf8_lossy(&stderr).to_string(),
                ));
            }
            Ok(String::from_utf8_lossy(&stdout).to_string())
        };

        tokio::time::timeout(timeout, run)
            .await
            .map_err(|_| ExecError::Timeout(self.config.timeout_seconds))?
    }

    async fn is_available(&self) -> bool {
        Command::new("which")
            .arg(&self.config.command)
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }
}
