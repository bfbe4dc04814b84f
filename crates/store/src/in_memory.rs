//! In-memory store: useful for testing and ephemeral sessions.

use agentrail_core::error::StoreError;
use agentrail_core::message::{ConversationId, Message};
use agentrail_core::store::ConversationStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Conversations kept in a map for the lifetime of the process.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    conversations: Arc<RwLock<HashMap<String, Vec<Message>>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries stored for a conversation.
    pub async fn len(&self, id: &ConversationId) -> usize {
        self.conversations
            .read()
            .await
            .get(id.as_str())
            .map_or(0, Vec::len)
    }
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    fn name(&self) -> &str { "memory" }

    async fn append_message(&self, id: &ConversationId, message: &Message) -> Result<(), StoreError> {
        self.conversations
            .write()
            .await
            .entry(id.0.clone())
            .or_default()
            .push(message.clone());
        Ok(())
    }

    async fn load(&self, id: &ConversationId) -> Result<Vec<Message>, StoreError> {
        Ok(self
            .conversations
            .read()
            .await
            .get(id.as_str())
            .cloned()
            .unwrap_or_default())
    }

    async fn list(&self) -> Result<Vec<ConversationId>, StoreError> {
        let mut ids: Vec<ConversationId> = self
            .conversations
            .read()
            .await
            .keys()
            .map(|k| ConversationId::from(k))
            .collect();
        ids.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_and_load_preserves_order() {
        let store = InMemoryStore::new();
        let id = ConversationId::from("c1");
        store.append_message(&id, &Message::user("one")).await.unwrap();
        store.append_message(&id, &Message::assistant("two")).await.unwrap();

        let loaded = store.load(&id).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].content, "one");
        assert_eq!(loaded[1].content, "two");
        assert_eq!(store.len(&id).await, 2);
    }

    #[tokio::test]
    async fn unknown_conversation_loads_empty() {
        let store = InMemoryStore::new();
        let loaded = store.load(&ConversationId::from("missing")).await.unwrap();
        assert!(loaded.is_empty());
        assert!(store.list().await.unwrap().is_empty());
    }
}
