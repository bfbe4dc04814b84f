//! Conversation store implementations for AgentRail.

pub mod noop;
pub mod in_memory;
pub mod file_store;

pub use noop::NoopStore;
pub use in_memory::InMemoryStore;
pub use file_store::FileStore;

use agentrail_config::AppConfig;
use agentrail_core::ConversationStore;
use std::sync::Arc;

/// Build the store selected by `store.backend`.
pub fn from_config(config: &AppConfig) -> Arc<dyn ConversationStore> {
    match config.store.backend.as_str() {
        "memory" => Arc::new(InMemoryStore::new()),
        "none" => Arc::new(NoopStore),
        _ => Arc::new(FileStore::new(config.store_dir())),
    }
}
