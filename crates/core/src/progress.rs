//! Progress events: immutable snapshots of a run, published to observers.
//!
//! The agent loop builds a [`ProgressEvent`] at every observable point
//! (assistant turn recorded, tool started, tool finished, verification,
//! completion) and hands it to the broadcaster, which throttles delivery
//! onto a [`ProgressBus`]. Field names serialize in camelCase so the SSE
//! stream matches what desktop and CLI clients already parse.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// What kind of work a step describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Thinking,
    ToolCall,
    ToolResult,
    Verification,
    Completion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Error,
    AwaitingApproval,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepToolCall {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepToolResult {
    pub success: bool,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One human-readable step in the run's recent history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressStep {
    pub id: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: StepStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<StepToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<StepToolResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_content: Option<String>,
}

impl ProgressStep {
    pub fn new(step_type: StepType, title: impl Into<String>, status: StepStatus) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            step_type,
            title: title.into(),
            description: None,
            status,
            timestamp: Utc::now(),
            tool_call: None,
            tool_result: None,
            llm_content: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_tool_call(mut self, name: impl Into<String>, arguments: serde_json::Value) -> Self {
        self.tool_call = Some(StepToolCall {
            name: name.into(),
            arguments,
        });
        self
    }

    pub fn with_tool_result(mut self, success: bool, content: impl Into<String>, error: Option<String>) -> Self {
        self.tool_result = Some(StepToolResult {
            success,
            content: content.into(),
            error,
        });
        self
    }

    pub fn with_llm_content(mut self, content: impl Into<String>) -> Self {
        self.llm_content = Some(content.into());
        self
    }
}

/// Text generated so far by a streaming model call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingContent {
    pub text: String,
    pub is_streaming: bool,
}

/// A tool call waiting for a human decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingApproval {
    pub approval_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// Retry/backoff state of a tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryInfo {
    pub tool_name: String,
    pub attempt: u32,
    pub max_retries: u32,
    pub delay_ms: u64,
    pub reason: String,
}

/// A snapshot of a run, keyed by session id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub current_iteration: u32,
    pub max_iterations: u32,
    pub steps: Vec<ProgressStep>,
    pub is_complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streaming_content: Option<StreamingContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_approval: Option<PendingApproval>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_info: Option<RetryInfo>,
}

impl ProgressEvent {
    pub fn new(session_id: impl Into<String>, current_iteration: u32, max_iterations: u32) -> Self {
        Self {
            session_id: session_id.into(),
            conversation_id: None,
            current_iteration,
            max_iterations,
            steps: Vec::new(),
            is_complete: false,
            final_content: None,
            streaming_content: None,
            pending_approval: None,
            retry_info: None,
        }
    }

    /// The terminal event delivered when a session is stopped from outside.
    pub fn stopped(session_id: impl Into<String>, current_iteration: u32, max_iterations: u32) -> Self {
        let mut event = Self::new(session_id, current_iteration, max_iterations);
        event.steps.push(
            ProgressStep::new(StepType::Completion, "Agent stopped", StepStatus::Error)
                .with_description("The run was stopped before it finished."),
        );
        event.is_complete = true;
        event.final_content = Some("(Agent mode was stopped by emergency kill switch)".into());
        event
    }

    /// Critical events bypass throttling: completion, a failed latest step,
    /// or a pending approval.
    pub fn is_critical(&self) -> bool {
        self.is_complete
            || self.pending_approval.is_some()
            || self
                .steps
                .last()
                .is_some_and(|s| s.status == StepStatus::Error)
    }
}

/// A broadcast-based bus that fans progress events out to observers.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub; each observer
/// filters by session id.
pub struct ProgressBus {
    sender: broadcast::Sender<Arc<ProgressEvent>>,
}

impl ProgressBus {
    /// Create a new bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: Arc<ProgressEvent>) {
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<ProgressEvent>> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new(256)
    }
}
