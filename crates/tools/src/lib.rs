//! Built-in tool implementations for AgentRail.
//!
//! Tools give the agent the ability to interact with the machine: run shell
//! commands and read or write files inside the workspace.

pub mod file_read;
pub mod file_write;
pub mod path_guard;
pub mod shell;

use agentrail_config::ToolsConfig;
use agentrail_core::ProcessTracker;
use agentrail_core::tool::ToolRegistry;
use std::time::Duration;

pub use path_guard::{PathError, PathGuard};

/// Create a registry with every built-in tool, configured from `[tools]`.
///
/// Shell children register with `processes` so a global stop can kill them.
pub fn default_registry(config: &ToolsConfig, processes: ProcessTracker) -> ToolRegistry {
    let guard = PathGuard::new(config.workspace_root.clone());
    let mut registry = ToolRegistry::new();
    registry.register(Box::new(
        shell::ShellTool::new(config.allowed_commands.clone(), processes)
            .with_workdir(config.workspace_root.clone())
            .with_timeout(Duration::from_secs(config.command_timeout_secs)),
    ));
    registry.register(Box::new(file_read::FileReadTool::new(guard.clone())));
    registry.register(Box::new(file_write::FileWriteTool::new(guard)));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentrail_core::ToolExecutor;

    #[test]
    fn default_registry_has_builtin_tools() {
        let registry = default_registry(&ToolsConfig::default(), ProcessTracker::new());
        assert_eq!(registry.names(), vec!["file_read", "file_write", "shell"]);
        let defs = registry.definitions();
        assert!(defs.iter().all(|d| d.parameters["type"] == "object"));
    }

    #[tokio::test]
    async fn registry_routes_calls_to_workspace_tools() {
        let dir = tempfile::tempdir().unwrap();
        let config = ToolsConfig {
            workspace_root: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let registry = default_registry(&config, ProcessTracker::new());

        let write = agentrail_core::ToolCall {
            id: "call_1".into(),
            name: "file_write".into(),
            arguments: serde_json::json!({"path": "a.txt", "content": "alpha"}),
        };
        assert!(!registry.execute(&write, None).await.unwrap().is_error);

        let read = agentrail_core::ToolCall {
            id: "call_2".into(),
            name: "file_read".into(),
            arguments: serde_json::json!({"path": "a.txt"}),
        };
        assert_eq!(registry.execute(&read, None).await.unwrap().content, "alpha");
    }
}
