//! File-based conversation store: one JSON-lines file per conversation.
//!
//! Each line is a JSON-encoded [`Message`]. Appends open the file in append
//! mode, so concurrent conversations never rewrite each other's history.
//!
//! Storage location: `~/.agentrail/conversations/<id>.jsonl`

use agentrail_core::error::StoreError;
use agentrail_core::message::{ConversationId, Message};
use agentrail_core::store::ConversationStore;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path for a conversation. Characters outside `[A-Za-z0-9_-]` are
    /// replaced so an id can never escape the store directory.
    fn path_for(&self, id: &ConversationId) -> PathBuf {
        let safe: String = id
            .as_str()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.jsonl"))
    }
}

#[async_trait]
impl ConversationStore for FileStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn append_message(&self, id: &ConversationId, message: &Message) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let mut line = serde_json::to_string(message)
            .map_err(|e| StoreError::Storage(format!("Failed to serialize entry: {e}")))?;
        line.push('\n');

        let path = self.path_for(id);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        debug!(conversation_id = %id, role = %message.role, "Appended conversation entry");
        Ok(())
    }

    async fn load(&self, id: &ConversationId) -> Result<Vec<Message>, StoreError> {
        let content = match tokio::fs::read_to_string(self.path_for(id)).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        Ok(content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str::<Message>(line) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(conversation_id = %id, error = %e, "Skipping corrupted conversation entry");
                    None
                }
            })
            .collect())
    }

    async fn list(&self) -> Result<Vec<ConversationId>, StoreError> {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("jsonl")
                && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
            {
                ids.push(ConversationId::from(stem));
            }
        }
        ids.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(ids)
    }
}
