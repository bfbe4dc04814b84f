//! Session registry: one cancellation token and configuration snapshot per run.
//!
//! The registry is owned by the runtime and injected into every loop, so tests
//! build isolated instances. Sessions live in a [`DashMap`], which gives
//! per-key locking without a global mutex.

use agentrail_core::SessionSnapshot;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Live state of one session.
#[derive(Debug)]
pub struct SessionState {
    id: String,
    snapshot: Arc<SessionSnapshot>,
    cancel: CancellationToken,
    iteration: AtomicU32,
}

impl SessionState {
    fn fresh(id: &str, snapshot: SessionSnapshot) -> Arc<Self> {
        debug!(session_id = %id, model = %snapshot.model, "Session created");
        Arc::new(Self {
            id: id.to_string(),
            snapshot: Arc::new(snapshot),
            cancel: CancellationToken::new(),
            iteration: AtomicU32::new(0),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The snapshot captured when the session was first created.
    pub fn snapshot(&self) -> Arc<SessionSnapshot> {
        self.snapshot.clone()
    }

    /// Token that resolves once a stop is requested. Never reset.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn iteration(&self) -> u32 {
        self.iteration.load(Ordering::SeqCst)
    }

    pub fn set_iteration(&self, iteration: u32) {
        self.iteration.store(iteration, Ordering::SeqCst);
    }
}

/// Concurrent map of active sessions keyed by session id.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<SessionState>>,
    cleanups: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session. Calling again for a live id is a no-op that keeps
    /// the original snapshot, which makes resuming a session safe.
    pub fn create(&self, id: &str, snapshot: SessionSnapshot) -> Arc<SessionState> {
        self.sessions
            .entry(id.to_string())
            .or_insert_with(|| SessionState::fresh(id, snapshot))
            .clone()
    }

    /// Register a session only if the id is not live. Returns `None` when
    /// another run already holds it.
    pub fn try_create(&self, id: &str, snapshot: SessionSnapshot) -> Option<Arc<SessionState>> {
        match self.sessions.entry(id.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(entry) => Some(entry.insert(SessionState::fresh(id, snapshot)).clone()),
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<SessionState>> {
        self.sessions.get(id).map(|s| s.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// Flag a session for cancellation. Returns whether the session exists.
    pub fn request_stop(&self, id: &str) -> bool {
        match self.sessions.get(id) {
            Some(session) => {
                if !session.cancel.is_cancelled() {
                    info!(session_id = %id, "Stop requested");
                    session.cancel.cancel();
                }
                true
            }
            None => false,
        }
    }

    /// Cheap read polled at every checkpoint. Unknown ids are not stopped.
    pub fn should_stop(&self, id: &str) -> bool {
        self.sessions
            .get(id)
            .is_some_and(|s| s.cancel.is_cancelled())
    }

    /// Flag every live session. Returns the ids that were flagged.
    pub fn stop_all(&self) -> Vec<String> {
        let mut ids = Vec::with_capacity(self.sessions.len());
        for entry in self.sessions.iter() {
            entry.cancel.cancel();
            ids.push(entry.key().clone());
        }
        if !ids.is_empty() {
            info!(count = ids.len(), "Stop requested for all sessions");
        }
        ids
    }

    /// Remove all state for a session. Returns whether anything was removed.
    pub fn cleanup(&self, id: &str) -> bool {
        let removed = self.sessions.remove(id).is_some();
        if removed {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
            debug!(session_id = %id, "Session cleaned up");
        }
        removed
    }

    pub fn snapshot(&self, id: &str) -> Option<Arc<SessionSnapshot>> {
        self.sessions.get(id).map(|s| s.snapshot.clone())
    }

    pub fn iteration(&self, id: &str) -> Option<u32> {
        self.sessions.get(id).map(|s| s.iteration())
    }

    pub fn active_sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Total sessions removed since the registry was built.
    pub fn cleanup_count(&self) -> u64 {
        self.cleanups.load(Ordering::SeqCst)
    }
}
