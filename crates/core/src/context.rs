//! Context shrinker trait: keeps the working conversation inside a token budget.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::message::Message;
use crate::provider::ToolDefinition;

/// Output of a shrink pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShrinkResult {
    pub messages: Vec<Message>,
    pub estimated_tokens: usize,
    pub max_tokens: usize,
}

#[async_trait]
pub trait ContextShrinker: Send + Sync {
    /// Trim `messages` so that they plus the tool schemas fit the budget.
    async fn shrink(&self, messages: Vec<Message>, tools: &[ToolDefinition]) -> Result<ShrinkResult>;
}
