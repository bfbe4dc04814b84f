//! Tracking of external child processes spawned by tools.
//!
//! A global stop must be able to kill every child a tool started without
//! touching the sessions' own machinery. Tools take a [`ProcessGuard`] before
//! spawning and select on [`ProcessGuard::cancelled`]; children are spawned
//! with `kill_on_drop(true)` so losing the race reaps them.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
struct Inner {
    token: Mutex<CancellationToken>,
    live: AtomicUsize,
}

/// Shared registry of live child processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessTracker {
    inner: Arc<Inner>,
}

impl ProcessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a child about to be spawned.
    pub fn guard(&self) -> ProcessGuard {
        let token = match self.inner.token.lock() {
            Ok(token) => token.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        self.inner.live.fetch_add(1, Ordering::SeqCst);
        ProcessGuard {
            token,
            inner: self.inner.clone(),
        }
    }

    /// Number of tracked children still running.
    pub fn live(&self) -> usize {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// Kill every tracked child. Returns how many were running.
    ///
    /// Children registered after this call are unaffected.
    pub fn terminate_all(&self) -> usize {
        let old = {
            let mut token = match self.inner.token.lock() {
                Ok(token) => token,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::replace(&mut *token, CancellationToken::new())
        };
        let count = self.live();
        old.cancel();
        if count > 0 {
            tracing::warn!(count, "Terminating tracked child processes");
        }
        count
    }
}

/// Held by a tool for the lifetime of one child process.
#[derive(Debug)]
pub struct ProcessGuard {
    token: CancellationToken,
    inner: Arc<Inner>,
}

impl ProcessGuard {
    /// Resolves when the tracker is told to terminate all children.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        self.inner.live.fetch_sub(1, Ordering::SeqCst);
    }
}
