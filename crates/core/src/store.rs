//! Conversation store trait: durable mirror of a session's working memory.
//!
//! The agent loop never awaits a store on its critical path; entries are
//! handed to a background worker that calls [`ConversationStore::append_message`].

use async_trait::async_trait;

use crate::error::StoreError;
use crate::message::{ConversationId, Message};

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// The name of this backend (e.g., "memory", "file").
    fn name(&self) -> &str;

    /// Append one entry (role, content, tool calls, tool results).
    async fn append_message(&self, conversation_id: &ConversationId, message: &Message) -> Result<(), StoreError>;

    /// Load every entry of a conversation, in order. Unknown ids load as empty.
    async fn load(&self, conversation_id: &ConversationId) -> Result<Vec<Message>, StoreError>;

    /// List known conversation ids.
    async fn list(&self) -> Result<Vec<ConversationId>, StoreError>;
}
