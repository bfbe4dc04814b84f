//! No-op store: disables conversation persistence entirely.

use agentrail_core::error::StoreError;
use agentrail_core::message::{ConversationId, Message};
use agentrail_core::store::ConversationStore;
use async_trait::async_trait;

/// A store that keeps nothing.
pub struct NoopStore;

#[async_trait]
impl ConversationStore for NoopStore {
    fn name(&self) -> &str { "none" }

    async fn append_message(&self, _id: &ConversationId, _message: &Message) -> Result<(), StoreError> {
        Ok(())
    }

    async fn load(&self, _id: &ConversationId) -> Result<Vec<Message>, StoreError> {
        Ok(Vec::new())
    }

    async fn list(&self) -> Result<Vec<ConversationId>, StoreError> {
        Ok(Vec::new())
    }
}
