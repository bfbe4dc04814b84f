//! Message and Conversation domain types.
//!
//! A conversation is the session's working memory: every user request,
//! assistant turn and tool-result turn is appended here, fed back into the
//! next model call and mirrored to the conversation store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tool::{ToolCall, ToolResult};

/// Unique identifier for a persisted conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The role of a message sender in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user
    User,
    /// The AI assistant
    Assistant,
    /// System instructions (never persisted)
    System,
    /// Summary of one batch of tool executions
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        };
        f.write_str(s)
    }
}

/// A single turn in a conversation.
///
/// An assistant turn may carry tool calls with empty `content`. A tool turn
/// carries the results of exactly one preceding assistant turn's calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub id: String,

    /// Who sent this message
    pub role: Role,

    /// The text content (may be empty)
    #[serde(default)]
    pub content: String,

    /// Tool calls requested by the assistant, in call order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    /// Tool results, in the same order as the calls they answer
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_results: Vec<ToolResult>,

    /// Timestamp
    pub timestamp: DateTime<Utc>,

    /// Optional metadata (termination reason, model, etc.)
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Message {
    fn with_role(role: Role, content: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content,
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
            timestamp: Utc::now(),
            metadata: serde_json::Map::new(),
        }
    }

    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content.into())
    }

    /// The user turn a run was started with. Marked so it can be told
    /// apart from instructions the loop injects later.
    pub fn request(content: impl Into<String>) -> Self {
        Self::user(content).with_metadata(REQUEST_KEY, serde_json::Value::Bool(true))
    }

    /// Create a new assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, content.into())
    }

    /// Create an assistant message that requests tool calls.
    pub fn assistant_with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        let mut msg = Self::with_role(Role::Assistant, content.into());
        msg.tool_calls = tool_calls;
        msg
    }

    /// Create a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, content.into())
    }

    /// Create a tool-result turn summarizing one batch.
    pub fn tool_results(content: impl Into<String>, results: Vec<ToolResult>) -> Self {
        let mut msg = Self::with_role(Role::Tool, content.into());
        msg.tool_results = results;
        msg
    }

    /// Attach a metadata key.
    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// Whether this is a run's starting request.
    pub fn is_request(&self) -> bool {
        self.role == Role::User && self.metadata.get(REQUEST_KEY).and_then(|v| v.as_bool()) == Some(true)
    }
}

const REQUEST_KEY: &str = "request";

/// Pair each tool call with its result.
///
/// Results are matched by correlation id when both sides carry one, falling
/// back to position otherwise. A call with no matching result gets `None`.
pub fn pair_results<'a>(
    calls: &'a [ToolCall],
    results: &'a [ToolResult],
) -> Vec<(&'a ToolCall, Option<&'a ToolResult>)> {
    calls
        .iter()
        .enumerate()
        .map(|(idx, call)| {
            let by_id = if call.id.is_empty() {
                None
            } else {
                results.iter().find(|r| r.call_id == call.id)
            };
            let matched = by_id.or_else(|| {
                results
                    .get(idx)
                    .filter(|r| r.call_id.is_empty() || call.id.is_empty())
            });
            (call, matched)
        })
        .collect()
}

/// A conversation is an ordered sequence of messages with shared context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    /// Unique conversation ID
    pub id: ConversationId,

    /// Ordered messages
    pub messages: Vec<Message>,

    /// When this conversation was created
    pub created_at: DateTime<Utc>,

    /// When the last message was added
    pub updated_at: DateTime<Utc>,

    /// Optional title (auto-generated or user-set)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl Conversation {
    /// Create a new empty conversation.
    pub fn new() -> Self {
        Self::with_id(ConversationId::new())
    }

    /// Create an empty conversation with a known id.
    pub fn with_id(id: ConversationId) -> Self {
        let now = Utc::now();
        Self {
            id,
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
            title: None,
        }
    }

    /// Add a message to the conversation.
    pub fn push(&mut self, message: Message) {
        self.updated_at = Utc::now();
        self.messages.push(message);
    }

    /// The most recent assistant turn, if any.
    pub fn last_assistant(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.role == Role::Assistant)
    }

    /// The most recent user request, if any.
    pub fn last_user(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.role == Role::User)
    }

    /// Get the total token count estimate (rough: 4 chars ≈ 1 token).
    pub fn estimated_tokens(&self) -> usize {
        self.messages.iter().map(|m| m.content.len() / 4).sum()
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(id: &str, name: &str) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: name.into(),
            arguments: serde_json::json!({}),
        }
    }

    fn result(call_id: &str, content: &str) -> ToolResult {
        ToolResult::success(call_id, content)
    }

    #[test]
    fn create_user_message() {
        let msg = Message::user("Hello, agent!");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.content, "Hello, agent!");
        assert!(msg.tool_calls.is_empty());
    }

    #[test]
    fn request_mark_survives_serialization() {
        let msg = Message::request("do the thing");
        assert!(msg.is_request());
        assert!(!Message::user("keep going").is_request());

        let back: Message = serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();
        assert!(back.is_request());
    }

    #[test]
    fn assistant_with_tool_calls_allows_empty_content() {
        let msg = Message::assistant_with_tool_calls("", vec![call("c1", "shell")]);
        assert!(msg.content.is_empty());
        assert!(msg.has_tool_calls());

        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.tool_calls.len(), 1);
        assert_eq!(back.role, Role::Assistant);
    }

    #[test]
    fn conversation_tracks_updates() {
        let mut conv = Conversation::new();
        let created = conv.created_at;

        conv.push(Message::user("First message"));
        assert_eq!(conv.messages.len(), 1);
        assert!(conv.updated_at >= created);
    }

    #[test]
    fn last_assistant_skips_tool_turns() {
        let mut conv = Conversation::new();
        conv.push(Message::user("do it"));
        conv.push(Message::assistant("working on it"));
        conv.push(Message::tool_results("ok", vec![]));
        assert_eq!(conv.last_assistant().unwrap().content, "working on it");
    }

    #[test]
    fn conversation_token_estimate() {
        let mut conv = Conversation::new();
        // 20 chars ≈ 5 tokens
        conv.push(Message::user("12345678901234567890"));
        assert_eq!(conv.estimated_tokens(), 5);
    }

    #[test]
    fn pair_results_matches_by_id_out_of_order() {
        let calls = vec![call("a", "one"), call("b", "two")];
        let results = vec![result("b", "second"), result("a", "first")];
        let pairs = pair_results(&calls, &results);
        assert_eq!(pairs[0].1.unwrap().content, "first");
        assert_eq!(pairs[1].1.unwrap().content, "second");
    }

    #[test]
    fn pair_results_falls_back_to_position() {
        let calls = vec![call("", "one"), call("", "two")];
        let results = vec![result("", "first"), result("", "second")];
        let pairs = pair_results(&calls, &results);
        assert_eq!(pairs[0].1.unwrap().content, "first");
        assert_eq!(pairs[1].1.unwrap().content, "second");
    }

    #[test]
    fn pair_results_missing_result_is_none() {
        let calls = vec![call("a", "one"), call("b", "two")];
        let results = vec![result("a", "first")];
        let pairs = pair_results(&calls, &results);
        assert!(pairs[0].1.is_some());
        assert!(pairs[1].1.is_none());
    }
}
