//! Shell-backed tool executor for the terminal driver.
//!
//! Only `execute_terminal_command` runs here. Browser, keyboard and mouse
//! automation need a desktop host and fail with a plain error, which the
//! agent loop records as the tool's result.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use tokio::process::Command;

use crate::agent_core::{ToolArguments, ToolExecutor};

/// Default per-command wall-clock limit.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Output beyond this many characters is cut before going back to the model.
const MAX_OUTPUT_CHARS: usize = 8_000;

/// Runs shell commands through `sh -c` (or `cmd /C` on Windows).
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    timeout: Duration,
    cwd: Option<PathBuf>,
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_TIMEOUT)
    }
}

impl ShellExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout, cwd: None }
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    async fn run_command(&self, command: &str) -> anyhow::Result<String> {
        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", command]);
            c
        };
        cmd.kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }

        tracing::info!(timeout_secs = self.timeout.as_secs(), "running shell command");

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(result) => result.context("failed to spawn shell")?,
            Err(_) => bail!("command timed out after {}s", self.timeout.as_secs()),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            let code = output
                .status
                .code()
                .map_or_else(|| "signal".to_string(), |c| c.to_string());
            tracing::warn!(exit = %code, "shell command failed");
            let detail = if stderr.trim().is_empty() { stdout.trim() } else { stderr.trim() };
            bail!("command exited with status {code}: {}", truncate(detail));
        }

        let mut combined = stdout.trim_end().to_string();
        if !stderr.trim().is_empty() {
            if !combined.is_empty() {
                combined.push('\n');
            }
            combined.push_str(stderr.trim_end());
        }
        if combined.is_empty() {
            return Ok("(no output)".to_string());
        }
        Ok(truncate(&combined))
    }
}

#[async_trait]
impl ToolExecutor for ShellExecutor {
    async fn run(&self, call: &ToolArguments) -> anyhow::Result<String> {
        match call {
            ToolArguments::ExecuteTerminalCommand { command } => self.run_command(command).await,
            other => bail!("{} is not available in terminal mode", other.tool().as_str()),
        }
    }
}

fn truncate(text: &str) -> String {
    match text.char_indices().nth(MAX_OUTPUT_CHARS) {
        Some((cut, _)) => format!("{}\n... (output truncated)", &text[..cut]),
        None => text.to_string(),
    }
}
