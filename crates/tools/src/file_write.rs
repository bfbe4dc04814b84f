//! File write tool: write or create files with path validation.

use agentrail_core::error::ToolError;
use agentrail_core::tool::{Tool, ToolOutput, ToolProgress};
use async_trait::async_trait;

use crate::path_guard::PathGuard;

#[derive(Default)]
pub struct FileWriteTool {
    guard: PathGuard,
}

impl FileWriteTool {
    pub fn new(guard: PathGuard) -> Self {
        Self { guard }
    }
}

#[async_trait]
impl Tool for FileWriteTool {
    fn name(&self) -> &str {
        "file_write"
    }

    fn description(&self) -> &str {
        "Write content to a file. Creates the file if it doesn't exist, overwrites if it does."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "The file path to write to, relative to the workspace"
                },
                "content": {
                    "type": "string",
                    "description": "The content to write"
                }
            },
            "required": ["path", "content"]
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
        let content = arguments["content"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'content' argument".into()))?;

        let resolved = self.guard.resolve(path).map_err(|e| ToolError::PermissionDenied {
            tool_name: "file_write".into(),
            reason: e.to_string(),
        })?;

        if let Some(parent) = resolved.parent()
            && let Err(e) = tokio::fs::create_dir_all(parent).await
        {
            return Ok(ToolOutput::error(format!("Failed to create directory: {e}")));
        }

        match tokio::fs::write(&resolved, content).await {
            Ok(()) => Ok(ToolOutput::ok(format!(
                "Successfully wrote {} bytes to {path}",
                content.len()
            ))),
            Err(e) => Ok(ToolOutput::error(format!("Failed to write file: {e}"))),
        }
    }
}
