//! Shell tool: execute system commands.
//!
//! Supports command allowlisting, workspace scoping, and a timeout. Every
//! child is registered with the shared [`ProcessTracker`] so an emergency
//! stop can kill it.

use agentrail_core::error::ToolError;
use agentrail_core::tool::{Tool, ToolOutput, ToolProgress};
use agentrail_core::ProcessTracker;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Execute shell commands with safety constraints.
pub struct ShellTool {
    /// If non-empty, only these commands are allowed.
    allowed_commands: Vec<String>,
    workdir: Option<PathBuf>,
    timeout: Duration,
    processes: ProcessTracker,
}

impl ShellTool {
    pub fn new(allowed_commands: Vec<String>, processes: ProcessTracker) -> Self {
        Self {
            allowed_commands,
            workdir: None,
            timeout: DEFAULT_TIMEOUT,
            processes,
        }
    }

    pub fn with_workdir(mut self, workdir: Option<PathBuf>) -> Self {
        self.workdir = workdir;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn is_command_allowed(&self, command: &str) -> bool {
        if self.allowed_commands.is_empty() {
            return true;
        }
        // Every segment of a pipeline or command list must be allowed.
        command
            .split(['|', ';', '&'])
            .filter_map(|segment| segment.split_whitespace().next())
            .all(|base| self.allowed_commands.iter().any(|a| a == base))
    }

    fn command(&self, command: &str) -> Command {
        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", command]);
            c
        };
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Execute a shell command and return stdout/stderr. Use this for running programs, checking files, git operations, etc."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(
        &self,
        arguments: serde_json::Value,
        progress: Option<ToolProgress>,
    ) -> Result<ToolOutput, ToolError> {
        let command = arguments["command"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'command' argument".into()))?;

        if !self.is_command_allowed(command) {
            return Err(ToolError::PermissionDenied {
                tool_name: "shell".into(),
                reason: format!("'{command}' is not in the command allowlist"),
            });
        }

        debug!(command = %command, "Executing shell command");
        if let Some(progress) = &progress {
            progress(&format!("$ {command}"));
        }

        let guard = self.processes.guard();
        let child = self.command(command).spawn().map_err(|e| ToolError::ExecutionFailed {
            tool_name: "shell".into(),
            reason: e.to_string(),
        })?;

        // Dropping the losing future drops the child, which kills it.
        let output = tokio::select! {
            _ = guard.cancelled() => {
                warn!(command = %command, "Command terminated by emergency stop");
                return Err(ToolError::Cancelled("terminated by emergency stop".into()));
            }
            r = tokio::time::timeout(self.timeout, child.wait_with_output()) => match r {
                Ok(output) => output.map_err(|e| ToolError::ExecutionFailed {
                    tool_name: "shell".into(),
                    reason: e.to_string(),
                })?,
                Err(_) => {
                    warn!(command = %command, timeout_secs = self.timeout.as_secs(), "Command timed out");
                    return Err(ToolError::Timeout {
                        tool_name: "shell".into(),
                        timeout_secs: self.timeout.as_secs(),
                    });
                }
            },
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if output.status.success() {
            let text = if stderr.trim().is_empty() {
                stdout.to_string()
            } else {
                format!("{stdout}\n[stderr]: {stderr}")
            };
            Ok(ToolOutput::ok(text.trim()))
        } else {
            let code = output.status.code().unwrap_or(-1);
            warn!(command = %command, exit_code = code, "Command failed");
            Ok(ToolOutput::error(format!("[exit code: {code}]\n{stdout}\n{stderr}").trim()))
        }
    }
}
