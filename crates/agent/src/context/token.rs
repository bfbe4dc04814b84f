//! Token estimation utilities.
//!
//! Uses a character-based heuristic: ~4 characters per token.
//! This approximation is accurate within ~10% for BPE tokenizers
//! (GPT-3.5, GPT-4, Claude) on English text.

use agentrail_core::{Message, ToolDefinition};

/// Estimate the token count for a string.
///
/// Heuristic: 1 token ≈ 4 characters. Rounds up.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    (text.len() + 3) / 4
}

/// Estimate tokens for a single message including per-message overhead.
///
/// Each message costs ~4 tokens of overhead for role name, delimiters,
/// and formatting markers in the API wire format. Tool calls count their
/// name and serialized arguments; tool results count their content.
pub fn estimate_message_tokens(message: &Message) -> usize {
    let overhead = 4;
    let calls: usize = message
        .tool_calls
        .iter()
        .map(|c| overhead + estimate_tokens(&c.name) + estimate_tokens(&c.arguments.to_string()))
        .sum();
    let results: usize = message
        .tool_results
        .iter()
        .map(|r| overhead + estimate_tokens(&r.content))
        .sum();
    overhead + estimate_tokens(&message.content) + calls + results
}

/// Estimate tokens for a slice of messages.
pub fn estimate_messages_tokens(messages: &[Message]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}

/// Estimate tokens for a tool definition (serialized as JSON).
pub fn estimate_tool_tokens(tool: &ToolDefinition) -> usize {
    let json = serde_json::to_string(tool).unwrap_or_default();
    estimate_tokens(&json)
}

/// Estimate tokens for a slice of tool definitions.
pub fn estimate_tools_tokens(tools: &[ToolDefinition]) -> usize {
    tools.iter().map(estimate_tool_tokens).sum()
}
