//! Progress broadcaster: per-session throttling in front of the progress bus.
//!
//! Routine events inside one throttle window collapse to the latest one;
//! critical events (completion, a failed step, a pending approval, or the
//! first event of a session) go out immediately and discard whatever routine
//! event was pending. [`ProgressBroadcaster::emit`] never waits on delivery.

use agentrail_core::{ProgressBus, ProgressEvent};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use dashmap::mapref::one::RefMut;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::session::SessionRegistry;

/// Bookkeeping for one session. At most one pending event and one timer.
#[derive(Debug, Default)]
struct ThrottleState {
    last_sent: Option<Instant>,
    pending: Option<Arc<ProgressEvent>>,
    timer: Option<JoinHandle<()>>,
    /// Bumped whenever a timer is cancelled; a flush task that wakes with an
    /// older generation does nothing.
    generation: u64,
    /// A terminal event went out; later events for the session are dropped.
    closed: bool,
}

impl ThrottleState {
    fn cancel_timer(&mut self) {
        self.generation += 1;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

pub struct ProgressBroadcaster {
    bus: Arc<ProgressBus>,
    registry: Arc<SessionRegistry>,
    window: Duration,
    throttle: Arc<DashMap<String, ThrottleState>>,
}

impl ProgressBroadcaster {
    pub fn new(bus: Arc<ProgressBus>, registry: Arc<SessionRegistry>, window: Duration) -> Self {
        Self {
            bus,
            registry,
            window,
            throttle: Arc::new(DashMap::new()),
        }
    }

    pub fn bus(&self) -> &Arc<ProgressBus> {
        &self.bus
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Hand an event to observers, subject to throttling.
    pub fn emit(&self, event: ProgressEvent) {
        let event = Arc::new(event);
        let session_id = event.session_id.clone();
        let Some(mut state) = self.state_for(&session_id) else {
            return;
        };

        if state.closed {
            trace!(session_id = %session_id, "Dropping progress event after terminal event");
            return;
        }

        let now = Instant::now();
        let critical = state.last_sent.is_none() || event.is_critical();

        if critical {
            state.pending = None;
            state.cancel_timer();
            state.last_sent = Some(now);
            state.closed = event.is_complete;
            self.bus.publish(event);
            return;
        }

        let elapsed = state.last_sent.map_or(self.window, |t| now.duration_since(t));
        if elapsed >= self.window {
            state.pending = None;
            state.cancel_timer();
            state.last_sent = Some(now);
            self.bus.publish(event);
            return;
        }

        state.pending = Some(event);
        if state.timer.is_none() {
            let remaining = self.window - elapsed;
            let generation = state.generation;
            state.timer = self.schedule_flush(session_id, remaining, generation);
        }
    }

    /// Send immediately regardless of throttling, discarding any pending event.
    pub fn force_emit(&self, event: ProgressEvent) {
        let event = Arc::new(event);
        let Some(mut state) = self.state_for(&event.session_id) else {
            return;
        };
        if state.closed {
            return;
        }
        state.pending = None;
        state.cancel_timer();
        state.last_sent = Some(Instant::now());
        state.closed = event.is_complete;
        self.bus.publish(event);
    }

    /// Throttle state for a live session. Sessions the registry no longer
    /// knows get no new entry, so nothing is delivered after cleanup.
    ///
    /// The vacant entry holds its shard lock across the registry check, and
    /// sessions leave the registry before [`Self::complete`] runs, so an entry
    /// created here is always removed by that session's `complete`.
    fn state_for(&self, session_id: &str) -> Option<RefMut<'_, String, ThrottleState>> {
        match self.throttle.entry(session_id.to_string()) {
            Entry::Occupied(entry) => Some(entry.into_ref()),
            Entry::Vacant(entry) if self.registry.contains(session_id) => Some(entry.insert(ThrottleState::default())),
            Entry::Vacant(_) => {
                trace!(session_id = %session_id, "Dropping progress event for finished session");
                None
            }
        }
    }

    /// Whether a terminal event has already been delivered for the session.
    pub fn is_closed(&self, session_id: &str) -> bool {
        self.throttle.get(session_id).is_some_and(|s| s.closed)
    }

    /// Drop all throttle bookkeeping for a finished session.
    pub fn complete(&self, session_id: &str) {
        if let Some((_, mut state)) = self.throttle.remove(session_id) {
            state.cancel_timer();
            debug!(session_id = %session_id, "Progress throttle state released");
        }
    }

    /// Number of sessions with throttle bookkeeping.
    pub fn tracked_sessions(&self) -> usize {
        self.throttle.len()
    }

    fn schedule_flush(&self, session_id: String, delay: Duration, generation: u64) -> Option<JoinHandle<()>> {
        let handle = tokio::runtime::Handle::try_current().ok()?;
        let throttle = self.throttle.clone();
        let registry = self.registry.clone();
        let bus = self.bus.clone();

        Some(handle.spawn(async move {
            tokio::time::sleep(delay).await;

            let Some(mut state) = throttle.get_mut(&session_id) else {
                return;
            };
            // Cancelled after waking; a newer timer may own the slot.
            if state.generation != generation {
                return;
            }
            state.timer = None;
            let Some(pending) = state.pending.take() else {
                return;
            };
            if state.closed || registry.should_stop(&session_id) {
                trace!(session_id = %session_id, "Discarding stale progress event");
                return;
            }
            state.last_sent = Some(Instant::now());
            bus.publish(pending);
        }))
    }
}
