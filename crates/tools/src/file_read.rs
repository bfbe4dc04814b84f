//! File read tool: read file contents with path validation.

use agentrail_core::error::ToolError;
use agentrail_core::tool::{Tool, ToolOutput, ToolProgress};
use async_trait::async_trait;

use crate::path_guard::PathGuard;

/// Larger files are cut at this many bytes.
const MAX_READ_BYTES: usize = 256 * 1024;

#[derive(Default)]
pub struct FileReadTool {
    guard: PathGuard,
}

impl FileReadTool {
    pub fn new(guard: PathGuard) -> Self {
        Self { guard }
    }
}

#[async_trait]
impl Tool for FileReadTool {
    fn name(&self) -> &str {
        "file_read"
    }

    fn description(&self) -> &str {
        "Read the contents of a file at the given path."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "The file path to read, relative to the workspace"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(
        &self,
        arguments: serde_json::Value,
        _progress: Option<ToolProgress>,
    ) -> Result<ToolOutput, ToolError> {
        let path = arguments["path"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'path' argument".into()))?;

        let resolved = self.guard.resolve(path).map_err(|e| ToolError::PermissionDenied {
            tool_name: "file_read".into(),
            reason: e.to_string(),
        })?;

        match tokio::fs::read(&resolved).await {
            Ok(bytes) if bytes.len() > MAX_READ_BYTES => {
                let head = String::from_utf8_lossy(&bytes[..MAX_READ_BYTES]);
                Ok(ToolOutput::ok(format!(
                    "{head}\n[... truncated, file is {} bytes]",
                    bytes.len()
                )))
            }
            Ok(bytes) => Ok(ToolOutput::ok(String::from_utf8_lossy(&bytes))),
            Err(e) => Ok(ToolOutput::error(format!("Failed to read file: {e}"))),
        }
    }
}
