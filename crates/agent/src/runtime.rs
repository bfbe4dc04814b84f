//! Runtime: owns the shared registries and exposes the control surface used
//! by the gateway and the CLI.

use agentrail_config::AppConfig;
use agentrail_core::{
    ConversationId, ConversationStore, Message, ProcessTracker, ProgressBus, ProgressEvent, Provider, ToolExecutor,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::approval::ApprovalRegistry;
use crate::broadcast::ProgressBroadcaster;
use crate::context::BudgetShrinker;
use crate::loop_runner::{AgentLoop, LoopSettings, RunOutcome, RunRequest};
use crate::persist::PersistenceHandle;
use crate::session::SessionRegistry;
use crate::verifier::ModelVerifier;

/// What an emergency stop touched.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopAllReport {
    pub sessions: Vec<String>,
    pub approvals_cancelled: usize,
    pub processes_terminated: usize,
}

/// Point-in-time view of a live session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub session_id: String,
    pub model: String,
    pub iteration: u32,
    pub max_iterations: u32,
    pub stopped: bool,
    pub pending_approvals: Vec<String>,
}

pub struct AgentRuntime {
    config: Arc<AppConfig>,
    registry: Arc<SessionRegistry>,
    broadcaster: Arc<ProgressBroadcaster>,
    approvals: Arc<ApprovalRegistry>,
    processes: ProcessTracker,
    store: Arc<dyn ConversationStore>,
    persistence: PersistenceHandle,
    agent: Arc<AgentLoop>,
}

/// Longest wait for queued writes before reading a conversation back.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

impl AgentRuntime {
    /// Build the runtime from configuration. Must be called inside a Tokio
    /// runtime; it starts the persistence worker.
    pub fn new(
        config: AppConfig,
        provider: Arc<dyn Provider>,
        tools: Arc<dyn ToolExecutor>,
        processes: ProcessTracker,
        store: Arc<dyn ConversationStore>,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let bus = Arc::new(ProgressBus::new(config.progress.bus_capacity));
        let broadcaster = Arc::new(ProgressBroadcaster::new(
            bus,
            registry.clone(),
            config.progress.throttle_window(),
        ));
        let approvals = Arc::new(ApprovalRegistry::new());
        let (persistence, _worker) = PersistenceHandle::spawn(store.clone());

        let mut agent = AgentLoop::new(provider.clone(), tools, registry.clone(), broadcaster.clone())
            .with_approvals(approvals.clone())
            .with_shrinker(Arc::new(BudgetShrinker::new(config.agent.context_max_tokens)))
            .with_persistence(persistence.clone())
            .with_settings(LoopSettings::from_config(&config));
        if config.agent.verify_completion {
            agent = agent.with_verifier(Arc::new(ModelVerifier::new(provider, config.default_model.clone())));
        }

        Self {
            config: Arc::new(config),
            registry,
            broadcaster,
            approvals,
            processes,
            store,
            persistence,
            agent: Arc::new(agent),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    pub fn processes(&self) -> &ProcessTracker {
        &self.processes
    }

    /// A request for a new session built from the configured defaults.
    pub fn new_request(&self, message: impl Into<String>) -> RunRequest {
        RunRequest::new(Uuid::new_v4().to_string(), message, self.config.session_snapshot())
    }

    /// Wait, up to a bound, for queued conversation writes to reach the store.
    /// Returns false when the store did not catch up in time.
    pub async fn flush_persistence(&self) -> bool {
        let flushed = tokio::time::timeout(FLUSH_TIMEOUT, self.persistence.flush()).await.is_ok();
        if !flushed {
            warn!(store = self.store.name(), "Conversation store is lagging behind");
        }
        flushed
    }

    /// Earlier turns of a stored conversation. Store failures yield an empty
    /// history.
    pub async fn load_history(&self, conversation_id: &ConversationId) -> Vec<Message> {
        self.flush_persistence().await;
        match self.store.load(conversation_id).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!(conversation = %conversation_id, error = %e, "Failed to load conversation history");
                Vec::new()
            }
        }
    }

    /// Run to completion on the current task.
    pub async fn run(&self, request: RunRequest) -> agentrail_core::Result<RunOutcome> {
        self.agent.run(request).await
    }

    /// Start a run on its own task. The session is registered before this
    /// returns, so it can be stopped immediately.
    pub fn spawn(&self, request: RunRequest) -> JoinHandle<agentrail_core::Result<RunOutcome>> {
        self.registry.create(&request.session_id, request.snapshot.clone());
        let agent = self.agent.clone();
        tokio::spawn(async move { agent.run(request).await })
    }

    /// Like [`Self::spawn`], but refuses a session id that is already live.
    /// The check and the registration are one step.
    pub fn try_spawn(&self, request: RunRequest) -> Option<JoinHandle<agentrail_core::Result<RunOutcome>>> {
        self.registry.try_create(&request.session_id, request.snapshot.clone())?;
        let agent = self.agent.clone();
        Some(tokio::spawn(async move { agent.run(request).await }))
    }

    /// Stop one session. Returns whether it was live.
    pub fn stop_session(&self, session_id: &str) -> bool {
        let found = self.registry.request_stop(session_id);
        if found {
            self.approvals.cancel_session(session_id);
        }
        found
    }

    /// Emergency stop: flag every session, release pending approvals, deliver
    /// a terminal event per session, and kill tracked child processes.
    pub fn stop_all(&self) -> StopAllReport {
        let sessions = self.registry.stop_all();
        let approvals_cancelled = self.approvals.cancel_all();
        for session_id in &sessions {
            let iteration = self.registry.iteration(session_id).unwrap_or(0);
            let max_iterations = self
                .registry
                .snapshot(session_id)
                .map_or(self.config.agent.max_iterations, |s| s.max_iterations);
            self.broadcaster
                .force_emit(ProgressEvent::stopped(session_id.clone(), iteration, max_iterations));
        }
        let processes_terminated = self.processes.terminate_all();
        warn!(
            sessions = sessions.len(),
            approvals_cancelled,
            processes_terminated,
            "Emergency stop"
        );
        StopAllReport {
            sessions,
            approvals_cancelled,
            processes_terminated,
        }
    }

    pub fn is_stopped(&self, session_id: &str) -> bool {
        self.registry.should_stop(session_id)
    }

    pub fn respond_approval(&self, approval_id: &str, approved: bool) -> bool {
        let answered = self.approvals.respond(approval_id, approved);
        if !answered {
            info!(approval_id, "Approval answer for unknown id");
        }
        answered
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<ProgressEvent>> {
        self.broadcaster.bus().subscribe()
    }

    pub fn session_status(&self, session_id: &str) -> Option<SessionStatus> {
        let session = self.registry.get(session_id)?;
        let snapshot = session.snapshot();
        Some(SessionStatus {
            session_id: session_id.to_string(),
            model: snapshot.model.clone(),
            iteration: session.iteration(),
            max_iterations: snapshot.max_iterations,
            stopped: session.is_stopped(),
            pending_approvals: self.approvals.pending_for(session_id),
        })
    }

    pub fn active_sessions(&self) -> Vec<String> {
        self.registry.active_sessions()
    }
}
