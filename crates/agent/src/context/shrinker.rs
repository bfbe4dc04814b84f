//! Budget shrinker: keeps the conversation under the model's context budget.
//!
//! Two passes, each applied only while the estimate is over budget:
//!
//! 1. Oversized tool outputs are cut down to `max_tool_output_chars`.
//! 2. The oldest turns are dropped.
//!
//! Leading system messages and the request being worked on are pinned. An
//! assistant turn that requested tools and the tool-result turn answering it
//! are kept or dropped together, and the newest turn is never dropped.

use agentrail_core::{ContextShrinker, Message, Role, ShrinkResult, ToolDefinition};
use async_trait::async_trait;
use tracing::debug;

use crate::context::token;

pub struct BudgetShrinker {
    max_tokens: usize,
    max_tool_output_chars: usize,
}

impl BudgetShrinker {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            max_tokens,
            max_tool_output_chars: 4_000,
        }
    }

    pub fn with_max_tool_output_chars(mut self, chars: usize) -> Self {
        self.max_tool_output_chars = chars;
        self
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// Synchronous core of [`ContextShrinker::shrink`].
    pub fn shrink_messages(&self, mut messages: Vec<Message>, tools: &[ToolDefinition]) -> ShrinkResult {
        let budget = self.max_tokens.saturating_sub(token::estimate_tools_tokens(tools));
        let mut estimated = token::estimate_messages_tokens(&messages);

        if estimated > budget {
            let mut truncated = 0;
            for message in messages.iter_mut().filter(|m| m.role == Role::Tool) {
                if truncate(&mut message.content, self.max_tool_output_chars) {
                    truncated += 1;
                }
                for result in &mut message.tool_results {
                    if truncate(&mut result.content, self.max_tool_output_chars) {
                        truncated += 1;
                    }
                }
            }
            estimated = token::estimate_messages_tokens(&messages);
            debug!(truncated, estimated, budget, "Truncated oversized tool outputs");
        }

        if estimated > budget {
            let systems = messages.iter().take_while(|m| m.role == Role::System).count();
            let anchor = current_request(&messages[systems..]).map(|m| m.id.clone());
            let mut turns = group_turns(messages.split_off(systems));
            let mut dropped = 0;
            while estimated > budget {
                let newest = turns.len().saturating_sub(1);
                let Some(oldest) = turns
                    .iter()
                    .take(newest)
                    .position(|turn| turn.first().map(|m| &m.id) != anchor.as_ref())
                else {
                    break;
                };
                let turn = turns.remove(oldest);
                estimated -= token::estimate_messages_tokens(&turn);
                dropped += turn.len();
            }
            messages.extend(turns.into_iter().flatten());
            debug!(dropped, estimated, budget, "Dropped oldest turns");
        }

        ShrinkResult {
            messages,
            estimated_tokens: estimated + token::estimate_tools_tokens(tools),
            max_tokens: self.max_tokens,
        }
    }
}

#[async_trait]
impl ContextShrinker for BudgetShrinker {
    async fn shrink(&self, messages: Vec<Message>, tools: &[ToolDefinition]) -> agentrail_core::Result<ShrinkResult> {
        Ok(self.shrink_messages(messages, tools))
    }
}

/// The request the run is working on: the latest marked request, else the
/// first message when it is a user turn.
fn current_request(messages: &[Message]) -> Option<&Message> {
    messages
        .iter()
        .rev()
        .find(|m| m.is_request())
        .or_else(|| messages.first().filter(|m| m.role == Role::User))
}

/// Split messages into droppable units, pairing each tool-calling assistant
/// turn with the tool turn that follows it.
fn group_turns(messages: Vec<Message>) -> Vec<Vec<Message>> {
    let mut turns: Vec<Vec<Message>> = Vec::new();
    for message in messages {
        let joins_previous = message.role == Role::Tool
            && turns
                .last()
                .and_then(|t| t.last())
                .is_some_and(|prev| prev.role == Role::Assistant && prev.has_tool_calls());
        match turns.last_mut() {
            Some(turn) if joins_previous => turn.push(message),
            _ => turns.push(vec![message]),
        }
    }
    turns
}

fn truncate(text: &mut String, max_chars: usize) -> bool {
    let Some((cut, _)) = text.char_indices().nth(max_chars) else {
        return false;
    };
    let removed = text[cut..].chars().count();
    text.truncate(cut);
    text.push_str(&format!("\n[... {removed} characters truncated]"));
    true
}
