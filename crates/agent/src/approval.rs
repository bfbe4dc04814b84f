//! Pending tool-call approvals.
//!
//! A tool that needs approval parks the run on a oneshot receiver until a
//! client answers through [`ApprovalRegistry::respond`]. Stopping a session
//! drops its senders, which the waiting loop reads as a denial.

use agentrail_core::ToolCall;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, info};
use uuid::Uuid;

struct PendingEntry {
    session_id: String,
    tool_name: String,
    reply: oneshot::Sender<bool>,
}

#[derive(Default)]
pub struct ApprovalRegistry {
    pending: DashMap<String, PendingEntry>,
}

impl ApprovalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending approval and return its id and the receiver the
    /// run waits on.
    pub fn request(&self, session_id: &str, call: &ToolCall) -> (String, oneshot::Receiver<bool>) {
        let approval_id = Uuid::new_v4().to_string();
        let (reply, wait) = oneshot::channel();
        self.pending.insert(
            approval_id.clone(),
            PendingEntry {
                session_id: session_id.to_string(),
                tool_name: call.name.clone(),
                reply,
            },
        );
        debug!(session_id, approval_id = %approval_id, tool = %call.name, "Approval requested");
        (approval_id, wait)
    }

    /// Answer a pending approval. Returns false for unknown or already
    /// answered ids.
    pub fn respond(&self, approval_id: &str, approved: bool) -> bool {
        let Some((_, entry)) = self.pending.remove(approval_id) else {
            return false;
        };
        info!(
            session_id = %entry.session_id,
            tool = %entry.tool_name,
            approved,
            "Approval answered"
        );
        entry.reply.send(approved).is_ok()
    }

    /// Drop every pending approval for a session.
    pub fn cancel_session(&self, session_id: &str) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, entry| entry.session_id != session_id);
        before.saturating_sub(self.pending.len())
    }

    /// Drop all pending approvals.
    pub fn cancel_all(&self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        count
    }

    pub fn pending_for(&self, session_id: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .pending
            .iter()
            .filter(|e| e.value().session_id == session_id)
            .map(|e| e.key().clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
