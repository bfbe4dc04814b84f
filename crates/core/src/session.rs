//! Per-session configuration snapshot.

use serde::{Deserialize, Serialize};

/// Configuration captured when a session is created.
///
/// The snapshot is immutable for the life of the session even if the global
/// configuration is reloaded concurrently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Provider name (e.g., "openrouter")
    pub provider: String,

    /// Model identifier
    pub model: String,

    /// Tools the session may use. `None` allows every registered tool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<Vec<String>>,

    /// Extra guideline text appended to the system prompt
    #[serde(default)]
    pub guidelines: String,

    /// Tools whose calls wait for a human approval
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub approval_required: Vec<String>,

    /// Iteration bound for this session
    pub max_iterations: u32,
}

impl SessionSnapshot {
    pub fn new(provider: impl Into<String>, model: impl Into<String>, max_iterations: u32) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            allowed_tools: None,
            guidelines: String::new(),
            approval_required: Vec::new(),
            max_iterations,
        }
    }

    pub fn allows_tool(&self, name: &str) -> bool {
        self.allowed_tools
            .as_ref()
            .is_none_or(|allowed| allowed.iter().any(|t| t == name))
    }

    pub fn requires_approval(&self, name: &str) -> bool {
        self.approval_required.iter().any(|t| t == name)
    }
}
