//! Background persistence of conversation turns.
//!
//! The loop enqueues appends without waiting; a single worker task writes
//! them to the store in order. Store failures are logged and never reach
//! the loop.

use agentrail_core::{ConversationId, ConversationStore, Message};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

enum Command {
    Append(ConversationId, Message),
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct PersistenceHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl PersistenceHandle {
    /// Start the worker. It exits once every handle is dropped.
    pub fn spawn(store: Arc<dyn ConversationStore>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    Command::Append(conversation_id, message) => {
                        if let Err(e) = store.append_message(&conversation_id, &message).await {
                            warn!(
                                store = store.name(),
                                conversation = %conversation_id,
                                error = %e,
                                "Failed to persist message"
                            );
                        }
                    }
                    Command::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("Persistence worker stopped");
        });
        (Self { tx }, worker)
    }

    /// Queue a message for writing. Never blocks.
    pub fn enqueue(&self, conversation_id: &ConversationId, message: &Message) {
        if self
            .tx
            .send(Command::Append(conversation_id.clone(), message.clone()))
            .is_err()
        {
            warn!(conversation = %conversation_id, "Persistence worker gone, message dropped");
        }
    }

    /// Wait until everything queued before this call has been written.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(Command::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }
}
