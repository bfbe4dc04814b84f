//! The agent loop: call the model, run the tools it asks for, and decide when
//! an answer ends the run.
//!
//! Every run registers its session, checks the session's cancellation token
//! at each checkpoint, and ends in exactly one [`TerminalState`]. Session
//! state is released by a drop guard, so cleanup happens once whether the run
//! finishes, fails, or its task is aborted.

use agentrail_config::AppConfig;
use agentrail_core::error::{Error, ProviderError};
use agentrail_core::{
    ContextShrinker, Conversation, ConversationId, Message, Provider, ProviderRequest, ProviderResponse, Role,
    SessionSnapshot, StepStatus, StepType, ToolCall, ToolDefinition, ToolExecutor, Verdict, Verifier, parse_completion_signal,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::approval::ApprovalRegistry;
use crate::broadcast::ProgressBroadcaster;
use crate::context::BudgetShrinker;
use crate::deliverable::DeliverableHeuristics;
use crate::executor::{
    BatchOutcome, ExecutionMode, RetryPolicy, ToolExecutionEngine, ToolExecutionResult, ToolFailureTracker,
    is_permission_error,
};
use crate::gate::{GateDecision, GateLimits, VerificationGate};
use crate::persist::PersistenceHandle;
use crate::progress::{RunProgress, step};
use crate::prompt::{self, BudgetReason};
use crate::session::{SessionRegistry, SessionState};

/// Tunables of one loop, usually taken from [`AppConfig`].
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub parallel_tools: bool,
    pub retry: RetryPolicy,
    /// Failures after which a tool is withdrawn for the rest of the run
    pub tool_failure_threshold: u32,
    pub gate: GateLimits,
    pub heuristics: DeliverableHeuristics,
    /// Extra attempts for a verifier call that errors or times out
    pub verification_retries: u32,
    pub verifier_timeout: Duration,
    pub model_timeout: Duration,
    /// Empty replies answered with a nudge before giving up
    pub max_empty_responses: u32,
    pub stream_responses: bool,
    pub max_recent_steps: usize,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: None,
            parallel_tools: true,
            retry: RetryPolicy::default(),
            tool_failure_threshold: 3,
            gate: GateLimits::default(),
            heuristics: DeliverableHeuristics::default(),
            verification_retries: 2,
            verifier_timeout: Duration::from_secs(60),
            model_timeout: Duration::from_secs(300),
            max_empty_responses: 3,
            stream_responses: false,
            max_recent_steps: 20,
        }
    }
}

impl LoopSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let agent = &config.agent;
        Self {
            temperature: config.default_temperature,
            max_tokens: Some(config.default_max_tokens),
            parallel_tools: agent.parallel_tool_execution,
            retry: RetryPolicy::new(agent.tool_retry_budget, agent.retry_backoff_base()),
            tool_failure_threshold: agent.tool_failure_threshold,
            gate: GateLimits {
                max_verification_failures: agent.max_verification_failures,
                max_nudges: agent.max_nudges,
                verify: agent.verify_completion,
                ..GateLimits::default()
            },
            heuristics: DeliverableHeuristics::from_config(&agent.deliverable),
            verification_retries: agent.verification_retries,
            verifier_timeout: agent.verifier_timeout(),
            model_timeout: agent.model_timeout(),
            max_empty_responses: agent.max_empty_responses,
            stream_responses: agent.stream_responses,
            max_recent_steps: config.progress.max_recent_steps,
        }
    }
}

/// Input of one run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub session_id: String,
    /// Continue this conversation; a new id is generated when absent
    pub conversation_id: Option<ConversationId>,
    /// Earlier turns of the conversation, oldest first
    pub history: Vec<Message>,
    pub message: String,
    pub snapshot: SessionSnapshot,
}

impl RunRequest {
    pub fn new(session_id: impl Into<String>, message: impl Into<String>, snapshot: SessionSnapshot) -> Self {
        Self {
            session_id: session_id.into(),
            conversation_id: None,
            history: Vec::new(),
            message: message.into(),
            snapshot,
        }
    }

    pub fn with_conversation(mut self, id: ConversationId, history: Vec<Message>) -> Self {
        self.conversation_id = Some(id);
        self.history = history;
        self
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalState {
    /// The answer passed the completion gate
    Completed,
    /// Stopped from outside
    Aborted,
    /// The gate gave up on reaching a verified answer
    ForcedIncomplete,
    MaxIterationsReached,
}

impl TerminalState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Aborted => "aborted",
            Self::ForcedIncomplete => "forced_incomplete",
            Self::MaxIterationsReached => "max_iterations_reached",
        }
    }
}

impl std::fmt::Display for TerminalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a run that reached a terminal state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    pub session_id: String,
    pub conversation_id: ConversationId,
    pub status: TerminalState,
    pub final_content: String,
    pub iterations: u32,
    #[serde(skip)]
    pub conversation: Conversation,
}

enum Flow {
    Next,
    Finish(TerminalState, String),
    Abort,
}

/// Mutable state of one run.
struct RunState {
    session: Arc<SessionState>,
    snapshot: Arc<SessionSnapshot>,
    cancel: CancellationToken,
    conversation: Conversation,
    progress: RunProgress,
    gate: VerificationGate,
    failures: ToolFailureTracker,
    tools_used: bool,
    empty_responses: u32,
}

/// Releases session bookkeeping when the run ends for any reason.
struct SessionCleanup<'a> {
    registry: &'a SessionRegistry,
    broadcaster: &'a ProgressBroadcaster,
    approvals: &'a ApprovalRegistry,
    session_id: String,
}

impl Drop for SessionCleanup<'_> {
    fn drop(&mut self) {
        self.approvals.cancel_session(&self.session_id);
        // Leave the registry first so no late emit can recreate throttle state.
        self.registry.cleanup(&self.session_id);
        self.broadcaster.complete(&self.session_id);
    }
}

/// The core agent loop that orchestrates LLM calls and tool execution.
pub struct AgentLoop {
    provider: Arc<dyn Provider>,
    tools: Arc<dyn ToolExecutor>,
    registry: Arc<SessionRegistry>,
    broadcaster: Arc<ProgressBroadcaster>,
    approvals: Arc<ApprovalRegistry>,
    shrinker: Arc<dyn ContextShrinker>,
    verifier: Option<Arc<dyn Verifier>>,
    persistence: Option<PersistenceHandle>,
    settings: LoopSettings,
}

impl AgentLoop {
    pub fn new(
        provider: Arc<dyn Provider>,
        tools: Arc<dyn ToolExecutor>,
        registry: Arc<SessionRegistry>,
        broadcaster: Arc<ProgressBroadcaster>,
    ) -> Self {
        Self {
            provider,
            tools,
            registry,
            broadcaster,
            approvals: Arc::new(ApprovalRegistry::new()),
            shrinker: Arc::new(BudgetShrinker::new(32_000)),
            verifier: None,
            persistence: None,
            settings: LoopSettings::default(),
        }
    }

    pub fn with_approvals(mut self, approvals: Arc<ApprovalRegistry>) -> Self {
        self.approvals = approvals;
        self
    }

    pub fn with_shrinker(mut self, shrinker: Arc<dyn ContextShrinker>) -> Self {
        self.shrinker = shrinker;
        self
    }

    /// Verify candidate answers with this verifier. Without one, deliverable
    /// answers are accepted as they are.
    pub fn with_verifier(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn with_persistence(mut self, persistence: PersistenceHandle) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn with_settings(mut self, settings: LoopSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &LoopSettings {
        &self.settings
    }

    pub fn approvals(&self) -> &Arc<ApprovalRegistry> {
        &self.approvals
    }

    /// Drive one request to a terminal state.
    ///
    /// Returns `Err` only for provider failures; every other ending is a
    /// [`RunOutcome`].
    pub async fn run(&self, request: RunRequest) -> Result<RunOutcome, Error> {
        let RunRequest {
            session_id,
            conversation_id,
            history,
            message,
            snapshot,
        } = request;

        let session = self.registry.create(&session_id, snapshot);
        let _cleanup = SessionCleanup {
            registry: &self.registry,
            broadcaster: &self.broadcaster,
            approvals: &self.approvals,
            session_id: session_id.clone(),
        };

        let snapshot = session.snapshot();
        let mut conversation = Conversation::with_id(conversation_id.unwrap_or_default());
        conversation.messages = history;
        info!(
            session_id = %session_id,
            conversation_id = %conversation.id,
            model = %snapshot.model,
            history = conversation.messages.len(),
            "Starting agent run"
        );

        let mut gate_limits = self.settings.gate;
        gate_limits.verify &= self.verifier.is_some();
        let mut state = RunState {
            cancel: session.token(),
            progress: RunProgress::new(
                self.broadcaster.clone(),
                session_id.clone(),
                conversation.id.to_string(),
                snapshot.max_iterations,
                self.settings.max_recent_steps,
            ),
            gate: VerificationGate::new(gate_limits, self.settings.heuristics.clone()),
            failures: ToolFailureTracker::new(self.settings.tool_failure_threshold),
            tools_used: false,
            empty_responses: 0,
            snapshot,
            session,
            conversation,
        };
        self.push(&mut state, Message::request(message));

        let max_iterations = state.snapshot.max_iterations;
        for iteration in 1..=max_iterations {
            if state.cancel.is_cancelled() {
                return Ok(self.finish(state, TerminalState::Aborted, prompt::ABORTED_MESSAGE.into()).await);
            }
            state.session.set_iteration(iteration);
            state.progress.set_iteration(iteration);
            debug!(session_id = %session_id, iteration, "Agent loop iteration");

            let flow = match self.iterate(&mut state).await {
                Ok(flow) => flow,
                Err(e) => {
                    error!(session_id = %session_id, iteration, error = %e, "Agent run failed");
                    state.progress.finish(&format!("Error: {e}"), false, "Run failed");
                    return Err(e);
                }
            };
            match flow {
                Flow::Next => {}
                Flow::Finish(status, content) => return Ok(self.finish(state, status, content).await),
                Flow::Abort => {
                    return Ok(self.finish(state, TerminalState::Aborted, prompt::ABORTED_MESSAGE.into()).await);
                }
            }
        }

        if state.cancel.is_cancelled() {
            return Ok(self.finish(state, TerminalState::Aborted, prompt::ABORTED_MESSAGE.into()).await);
        }
        let reason = if state.failures.has_exclusions() {
            BudgetReason::RepeatedFailures
        } else {
            BudgetReason::IterationLimit
        };
        warn!(session_id = %session_id, max_iterations, ?reason, "Max iterations reached");
        let last = state
            .conversation
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant && !m.content.trim().is_empty())
            .map(|m| m.content.clone());
        let content = prompt::budget_exhausted_message(last.as_deref(), max_iterations, reason);
        Ok(self.finish(state, TerminalState::MaxIterationsReached, content).await)
    }

    async fn iterate(&self, state: &mut RunState) -> Result<Flow, Error> {
        let iteration = state.progress.iteration();
        let active = self.active_tools(state);

        let mut messages = Vec::with_capacity(state.conversation.messages.len() + 1);
        messages.push(Message::system(prompt::build_system_prompt(&state.snapshot, &active)));
        messages.extend(state.conversation.messages.iter().cloned());

        let shrunk = tokio::select! {
            biased;
            _ = state.cancel.cancelled() => return Ok(Flow::Abort),
            r = self.shrinker.shrink(messages.clone(), &active) => r,
        };
        let messages = match shrunk {
            Ok(result) => {
                debug!(tokens = result.estimated_tokens, max = result.max_tokens, "Context prepared");
                result.messages
            }
            Err(e) => {
                warn!(error = %e, "Context shrinking failed, sending the full conversation");
                messages
            }
        };

        let think_id = format!("think-{iteration}");
        state
            .progress
            .push_step(step(&think_id, StepType::Thinking, "Thinking", StepStatus::InProgress));

        let mut request = ProviderRequest::new(state.snapshot.model.clone(), messages);
        request.temperature = self.settings.temperature;
        request.max_tokens = self.settings.max_tokens;
        request.tools = active.clone();
        request.stream = self.settings.stream_responses;

        let response = tokio::select! {
            biased;
            _ = state.cancel.cancelled() => return Ok(Flow::Abort),
            r = tokio::time::timeout(self.settings.model_timeout, self.call_model(request, &state.progress)) => r,
        };
        let response = response.unwrap_or_else(|_| {
            Err(ProviderError::Timeout(format!(
                "no model response within {}s",
                self.settings.model_timeout.as_secs()
            )))
        });
        let response = match response {
            Ok(r) if r.message.content.trim().is_empty() && r.message.tool_calls.is_empty() => None,
            Ok(r) => Some(r),
            Err(e) if e.is_empty_response() => None,
            Err(e) => return Err(e.into()),
        };
        let Some(response) = response else {
            return Ok(self.on_empty_response(state, &think_id));
        };
        state.empty_responses = 0;

        if response.message.tool_calls.is_empty() {
            let candidate = response.message.content;
            state.progress.update_step(&think_id, |s| {
                s.status = StepStatus::Completed;
                s.llm_content = Some(candidate.clone());
            });
            return Ok(self.judge(state, candidate).await);
        }

        Ok(self.run_tools(state, response, &active, &think_id).await)
    }

    async fn call_model(
        &self,
        request: ProviderRequest,
        progress: &RunProgress,
    ) -> Result<ProviderResponse, ProviderError> {
        if !request.stream {
            return self.provider.complete(request).await;
        }

        let model = request.model.clone();
        let mut chunks = self.provider.stream(request).await?;
        let mut text = String::new();
        let mut tool_calls = Vec::new();
        let mut usage = None;
        while let Some(chunk) = chunks.recv().await {
            let chunk = chunk?;
            if let Some(delta) = chunk.content.filter(|c| !c.is_empty()) {
                text.push_str(&delta);
                progress.stream_text(&text);
            }
            tool_calls.extend(chunk.tool_calls);
            if chunk.usage.is_some() {
                usage = chunk.usage;
            }
            if chunk.done {
                break;
            }
        }
        let (text, needs_more_work) = match parse_completion_signal(&text) {
            Some((content, more)) => (content, Some(more)),
            None => (text, None),
        };
        Ok(ProviderResponse {
            message: Message::assistant_with_tool_calls(text, tool_calls),
            usage,
            model,
            needs_more_work,
        })
    }

    fn on_empty_response(&self, state: &mut RunState, think_id: &str) -> Flow {
        state.empty_responses += 1;
        state.progress.update_step(think_id, |s| {
            s.status = StepStatus::Completed;
            s.description = Some("Empty response".into());
        });
        if state.empty_responses > self.settings.max_empty_responses {
            warn!(count = state.empty_responses, "Giving up after repeated empty responses");
            return Flow::Finish(TerminalState::ForcedIncomplete, prompt::EMPTY_RESPONSE_FALLBACK.into());
        }
        debug!(count = state.empty_responses, "Empty model response, nudging");
        self.push(state, Message::user(prompt::EMPTY_RESPONSE_NUDGE));
        Flow::Next
    }

    /// Pass a tool-free answer through the completion gate.
    async fn judge(&self, state: &mut RunState, candidate: String) -> Flow {
        let decision = match state.gate.screen(&candidate) {
            GateDecision::Verify => match &self.verifier {
                Some(verifier) => {
                    let verify_id = format!("verify-{}", state.progress.iteration());
                    state.progress.push_step(step(
                        &verify_id,
                        StepType::Verification,
                        "Verifying completion",
                        StepStatus::InProgress,
                    ));
                    let mut transcript = state.conversation.messages.clone();
                    transcript.push(Message::assistant(candidate.clone()));
                    let Some(verdict) = self.verify(&**verifier, &transcript, &state.cancel).await else {
                        return Flow::Abort;
                    };
                    let description = match &verdict {
                        Ok(v) if v.is_complete => "Complete".to_string(),
                        Ok(v) if v.missing_items.is_empty() => format!("Incomplete: {}", v.reason),
                        Ok(v) => format!("Incomplete: {}", v.missing_items.join(", ")),
                        Err(e) => format!("Verifier error: {e}"),
                    };
                    state.progress.update_step(&verify_id, |s| {
                        s.status = StepStatus::Completed;
                        s.description = Some(description);
                    });
                    state.gate.record_verdict(&candidate, verdict, state.tools_used)
                }
                None => GateDecision::Accept {
                    content: candidate.trim().to_string(),
                },
            },
            other => other,
        };

        match decision {
            GateDecision::Accept { content } => Flow::Finish(TerminalState::Completed, content),
            GateDecision::ForceIncomplete { content } => Flow::Finish(TerminalState::ForcedIncomplete, content),
            GateDecision::Continue { instruction } => {
                if !candidate.trim().is_empty() {
                    self.push(state, Message::assistant(candidate));
                }
                self.push(state, Message::user(instruction));
                Flow::Next
            }
            GateDecision::Verify => Flow::Next,
        }
    }

    /// Call the verifier with retries. `None` means the run was stopped.
    async fn verify(
        &self,
        verifier: &dyn Verifier,
        transcript: &[Message],
        cancel: &CancellationToken,
    ) -> Option<Result<Verdict, String>> {
        let attempts = self.settings.verification_retries + 1;
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                r = tokio::time::timeout(self.settings.verifier_timeout, verifier.verify(transcript)) => r,
            };
            match outcome {
                Ok(Ok(verdict)) => return Some(Ok(verdict)),
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => {
                    last_error = format!(
                        "verifier timed out after {}s",
                        self.settings.verifier_timeout.as_secs()
                    )
                }
            }
            warn!(attempt, attempts, error = %last_error, "Verifier call failed");
        }
        Some(Err(last_error))
    }

    async fn run_tools(
        &self,
        state: &mut RunState,
        response: ProviderResponse,
        active: &[ToolDefinition],
        think_id: &str,
    ) -> Flow {
        let ProviderResponse {
            message,
            needs_more_work,
            ..
        } = response;
        let content = message.content.clone();
        let calls = message.tool_calls.clone();
        state.progress.update_step(think_id, |s| {
            s.status = StepStatus::Completed;
            s.description = Some(format!("Requested {} tool call(s)", calls.len()));
            if !content.trim().is_empty() {
                s.llm_content = Some(content.clone());
            }
        });
        self.push(state, message);

        let mut slots: Vec<Option<ToolExecutionResult>> = vec![None; calls.len()];
        let mut runnable = Vec::with_capacity(calls.len());
        for (index, call) in calls.iter().enumerate() {
            if !active.iter().any(|t| t.name == call.name) {
                warn!(tool = %call.name, "Model requested an unavailable tool");
                slots[index] = Some(ToolExecutionResult::failed(
                    call,
                    format!("Tool '{}' is not available", call.name),
                ));
                continue;
            }
            if state.snapshot.requires_approval(&call.name) {
                match self.await_approval(state, index, call).await {
                    Some(true) => {}
                    Some(false) => {
                        slots[index] = Some(ToolExecutionResult::failed(call, "Tool call denied by user"));
                        continue;
                    }
                    None => {
                        self.record_batch(state, &calls, slots);
                        return Flow::Abort;
                    }
                }
            }
            runnable.push(index);
        }

        let batch: Vec<ToolCall> = runnable.iter().map(|&i| calls[i].clone()).collect();
        let outcome = if batch.is_empty() {
            BatchOutcome::default()
        } else {
            let engine = ToolExecutionEngine::new(self.tools.clone(), self.settings.retry);
            let mode = ExecutionMode::for_batch(batch.len(), self.settings.parallel_tools);
            engine.execute_batch(&batch, mode, &state.cancel, &state.progress).await
        };
        let cancelled = outcome.cancelled;
        for (&index, result) in runnable.iter().zip(outcome.results) {
            slots[index] = Some(result);
        }
        let results = self.record_batch(state, &calls, slots);
        if cancelled || state.cancel.is_cancelled() {
            return Flow::Abort;
        }

        let mut wrap_up = false;
        for index in &runnable {
            let r = &results[*index];
            if r.result.success || r.cancelled {
                continue;
            }
            state.failures.record_failure(&r.call.name);
            if r.result.error.as_deref().is_some_and(is_permission_error) {
                wrap_up = true;
            }
        }
        state.tools_used |= !runnable.is_empty();
        if wrap_up {
            info!("Permission failure, asking the model to wrap up");
            self.push(state, Message::user(prompt::WRAP_UP_INSTRUCTION));
        }

        let all_succeeded = results.iter().all(|r| r.result.success);
        if needs_more_work == Some(false) && all_succeeded && !content.trim().is_empty() {
            debug!("Model signalled completion alongside its tool calls");
            return self.judge(state, content).await;
        }
        Flow::Next
    }

    /// Append the tool-result turn for a batch. Calls that never ran are
    /// recorded as cancelled.
    fn record_batch(
        &self,
        state: &mut RunState,
        calls: &[ToolCall],
        slots: Vec<Option<ToolExecutionResult>>,
    ) -> Vec<ToolExecutionResult> {
        let results: Vec<ToolExecutionResult> = calls
            .iter()
            .zip(slots)
            .map(|(call, slot)| slot.unwrap_or_else(|| ToolExecutionResult::cancelled(call, 0)))
            .collect();
        let summary = prompt::summarize_tool_results(&results);
        let turn = Message::tool_results(summary, results.iter().map(|r| r.result.clone()).collect());
        self.push(state, turn);
        results
    }

    /// Park until a client answers. `None` means the run was stopped.
    async fn await_approval(&self, state: &RunState, index: usize, call: &ToolCall) -> Option<bool> {
        let (approval_id, reply) = self.approvals.request(state.session.id(), call);
        let step_id = format!("approval-{}-{}", state.progress.iteration(), index);
        state.progress.awaiting_approval(&step_id, &approval_id, call);
        info!(session_id = %state.session.id(), tool = %call.name, approval_id = %approval_id, "Waiting for approval");

        let approved = tokio::select! {
            biased;
            _ = state.cancel.cancelled() => return None,
            r = reply => r.unwrap_or(false),
        };
        if state.cancel.is_cancelled() {
            return None;
        }
        state.progress.update_step(&step_id, |s| {
            s.status = if approved {
                StepStatus::Completed
            } else {
                StepStatus::Error
            };
            s.title = if approved {
                format!("{} approved", call.name)
            } else {
                format!("{} denied", call.name)
            };
        });
        Some(approved)
    }

    /// Tools offered this iteration: the session allow-list minus tools
    /// withdrawn after repeated failures.
    fn active_tools(&self, state: &RunState) -> Vec<ToolDefinition> {
        self.tools
            .definitions()
            .into_iter()
            .filter(|t| state.snapshot.allows_tool(&t.name) && !state.failures.is_excluded(&t.name))
            .collect()
    }

    fn push(&self, state: &mut RunState, message: Message) {
        if let Some(persistence) = &self.persistence {
            persistence.enqueue(&state.conversation.id, &message);
        }
        state.conversation.push(message);
    }

    async fn finish(&self, mut state: RunState, status: TerminalState, content: String) -> RunOutcome {
        let content = if content.trim().is_empty() {
            prompt::no_progress_fallback("")
        } else {
            content
        };
        self.push(
            &mut state,
            Message::assistant(content.clone()).with_metadata("termination", serde_json::json!(status.as_str())),
        );

        let summary = match status {
            TerminalState::Completed => "Completed",
            TerminalState::Aborted => "Agent stopped",
            TerminalState::ForcedIncomplete => "Finished incomplete",
            TerminalState::MaxIterationsReached => "Iteration limit reached",
        };
        state.progress.finish(&content, status == TerminalState::Completed, summary);

        let iterations = state.progress.iteration();
        info!(
            session_id = %state.session.id(),
            %status,
            iterations,
            messages = state.conversation.messages.len(),
            "Agent run finished"
        );
        RunOutcome {
            session_id: state.session.id().to_string(),
            conversation_id: state.conversation.id.clone(),
            status,
            final_content: content,
            iterations,
            conversation: state.conversation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{
        ScriptedExecutor, ScriptedVerifier, SequentialMockProvider, make_text_response, make_tool_call,
        make_tool_call_response,
    };
    use agentrail_core::{ProgressBus, ProgressEvent, ToolOutput};
    use tokio::sync::broadcast::Receiver;

    struct Harness {
        registry: Arc<SessionRegistry>,
        broadcaster: Arc<ProgressBroadcaster>,
        events: Receiver<Arc<ProgressEvent>>,
    }

    fn harness() -> Harness {
        let bus = Arc::new(ProgressBus::new(1024));
        let events = bus.subscribe();
        let registry = Arc::new(SessionRegistry::new());
        let broadcaster = Arc::new(ProgressBroadcaster::new(bus, registry.clone(), Duration::from_millis(150)));
        Harness {
            registry,
            broadcaster,
            events,
        }
    }

    fn agent(h: &Harness, provider: Arc<SequentialMockProvider>, tools: Arc<ScriptedExecutor>) -> AgentLoop {
        AgentLoop::new(provider, tools, h.registry.clone(), h.broadcaster.clone())
    }

    fn request(max_iterations: u32) -> RunRequest {
        RunRequest::new("s1", "Summarize the repository", SessionSnapshot::new("mock", "mock-model", max_iterations))
    }

    fn drain(events: &mut Receiver<Arc<ProgressEvent>>) -> Vec<Arc<ProgressEvent>> {
        std::iter::from_fn(|| events.try_recv().ok()).collect()
    }

    fn roles(outcome: &RunOutcome) -> Vec<Role> {
        outcome.conversation.messages.iter().map(|m| m.role).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn tool_then_verified_answer_completes() {
        let mut h = harness();
        let provider = Arc::new(SequentialMockProvider::new(vec![
            make_tool_call_response(vec![make_tool_call("echo", serde_json::json!({"text": "hi"}))], ""),
            make_text_response("The repository contains 3 crates."),
        ]));
        let tools = Arc::new(ScriptedExecutor::new());
        tools.script("echo", vec![Ok(ToolOutput::ok("hi"))]);
        let verifier = Arc::new(ScriptedVerifier::always_complete());
        let agent = agent(&h, provider.clone(), tools.clone()).with_verifier(verifier.clone());

        let outcome = agent.run(request(10)).await.unwrap();

        assert_eq!(outcome.status, TerminalState::Completed);
        assert_eq!(outcome.final_content, "The repository contains 3 crates.");
        assert_eq!(outcome.iterations, 2);
        assert_eq!(roles(&outcome), vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]);
        assert_eq!(tools.calls("echo"), 1);
        assert_eq!(verifier.calls(), 1);

        let events = drain(&mut h.events);
        assert_eq!(events.iter().filter(|e| e.is_complete).count(), 1);
        assert!(events.last().unwrap().is_complete);
        assert!(h.registry.is_empty());
        assert_eq!(h.registry.cleanup_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_tool_call_yields_single_terminal_event() {
        let mut h = harness();
        let provider = Arc::new(SequentialMockProvider::new(vec![make_tool_call_response(
            vec![make_tool_call("slow", serde_json::json!({}))],
            "",
        )]));
        let tools = Arc::new(ScriptedExecutor::new());
        tools.script_delayed("slow", Duration::from_secs(3600), vec![Ok(ToolOutput::ok("never"))]);
        let agent = Arc::new(agent(&h, provider, tools));

        let task = tokio::spawn({
            let agent = agent.clone();
            async move { agent.run(request(10)).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.registry.request_stop("s1"));

        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome.status, TerminalState::Aborted);
        assert_eq!(outcome.final_content, prompt::ABORTED_MESSAGE);
        let last = outcome.conversation.messages.last().unwrap();
        assert_eq!(last.role, Role::Assistant);
        let tool_turn = &outcome.conversation.messages[outcome.conversation.messages.len() - 2];
        assert_eq!(tool_turn.role, Role::Tool);
        assert!(tool_turn.content.contains("cancelled"));

        tokio::time::sleep(Duration::from_secs(1)).await;
        let events = drain(&mut h.events);
        assert_eq!(events.iter().filter(|e| e.is_complete).count(), 1);
        assert!(h.registry.is_empty());
        assert_eq!(h.broadcaster.tracked_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn repeatedly_failing_tool_is_withdrawn() {
        let h = harness();
        let flaky = make_tool_call("flaky", serde_json::json!({}));
        let provider = Arc::new(SequentialMockProvider::new(vec![
            make_tool_call_response(vec![flaky.clone()], ""),
            make_tool_call_response(vec![flaky.clone()], ""),
            make_tool_call_response(vec![flaky], ""),
            make_text_response("The flaky tool kept failing, so the summary is based on echo output."),
        ]));
        let tools = Arc::new(ScriptedExecutor::new());
        tools.script("flaky", vec![Ok(ToolOutput::error("invalid input"))]);
        tools.script("echo", vec![Ok(ToolOutput::ok("ok"))]);
        let agent = agent(&h, provider.clone(), tools.clone());

        let outcome = agent.run(request(10)).await.unwrap();

        assert_eq!(outcome.status, TerminalState::Completed);
        assert_eq!(tools.calls("flaky"), 3);
        assert_eq!(provider.offered_tools(2), vec!["echo", "flaky"]);
        assert_eq!(provider.offered_tools(3), vec!["echo"]);
        let system = &provider.requests()[3].messages[0];
        assert_eq!(system.role, Role::System);
        assert!(!system.content.contains("- flaky:"));
        assert!(system.content.contains("- echo:"));
    }

    #[tokio::test(start_paused = true)]
    async fn status_update_gets_nudged() {
        let h = harness();
        let provider = Arc::new(SequentialMockProvider::new(vec![
            make_text_response("Let me check the logs now"),
            make_text_response("The logs show three errors in auth.rs."),
        ]));
        let agent = agent(&h, provider.clone(), Arc::new(ScriptedExecutor::new()));

        let outcome = agent.run(request(10)).await.unwrap();

        assert_eq!(outcome.status, TerminalState::Completed);
        assert_eq!(outcome.final_content, "The logs show three errors in auth.rs.");
        assert_eq!(provider.call_count(), 2);
        let messages = &outcome.conversation.messages;
        assert_eq!(messages[1].content, "Let me check the logs now");
        assert_eq!(messages[2].role, Role::User);
        assert!(messages[2].content.contains("instead of doing it"));
    }

    #[tokio::test(start_paused = true)]
    async fn verification_budget_forces_incomplete() {
        let h = harness();
        let provider = Arc::new(SequentialMockProvider::single_text("Here is the full report: everything is fine."));
        let verifier = Arc::new(ScriptedVerifier::always_incomplete("test results"));
        let agent = agent(&h, provider.clone(), Arc::new(ScriptedExecutor::new())).with_verifier(verifier.clone());

        let outcome = agent.run(request(10)).await.unwrap();

        assert_eq!(outcome.status, TerminalState::ForcedIncomplete);
        assert_eq!(verifier.calls(), 5);
        assert_eq!(provider.call_count(), 5);
        assert!(outcome.final_content.contains("- test results"));
        assert_eq!(outcome.conversation.messages.last().unwrap().role, Role::Assistant);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_empty_responses_give_up() {
        let h = harness();
        let provider = Arc::new(SequentialMockProvider::single_text("   "));
        let agent = agent(&h, provider.clone(), Arc::new(ScriptedExecutor::new()));

        let outcome = agent.run(request(10)).await.unwrap();

        assert_eq!(outcome.status, TerminalState::ForcedIncomplete);
        assert_eq!(outcome.final_content, prompt::EMPTY_RESPONSE_FALLBACK);
        assert_eq!(provider.call_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn iteration_limit_synthesizes_answer() {
        let h = harness();
        let provider = Arc::new(SequentialMockProvider::new(vec![make_tool_call_response(
            vec![make_tool_call("echo", serde_json::json!({}))],
            "Still collecting data",
        )]));
        let tools = Arc::new(ScriptedExecutor::new());
        tools.script("echo", vec![Ok(ToolOutput::ok(""))]);
        let agent = agent(&h, provider, tools);

        let outcome = agent.run(request(2)).await.unwrap();

        assert_eq!(outcome.status, TerminalState::MaxIterationsReached);
        assert!(outcome.final_content.starts_with("Still collecting data"));
        assert!(outcome.final_content.contains("maximum of 2"));
        let tool_turn = &outcome.conversation.messages[2];
        assert!(tool_turn.content.contains(prompt::NO_OUTPUT));
        assert_eq!(h.registry.cleanup_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn provider_error_emits_terminal_event_and_cleans_up() {
        let mut h = harness();
        let provider = Arc::new(SequentialMockProvider::with_results(vec![Err(ProviderError::Network(
            "connection reset".into(),
        ))]));
        let agent = agent(&h, provider, Arc::new(ScriptedExecutor::new()));

        let err = agent.run(request(10)).await.unwrap_err();
        assert!(err.to_string().contains("connection reset"));

        let events = drain(&mut h.events);
        let last = events.last().unwrap();
        assert!(last.is_complete);
        assert_eq!(last.steps.last().unwrap().status, StepStatus::Error);
        assert!(h.registry.is_empty());
        assert_eq!(h.registry.cleanup_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn denied_approval_skips_the_tool() {
        let mut h = harness();
        let provider = Arc::new(SequentialMockProvider::new(vec![
            make_tool_call_response(vec![make_tool_call("shell", serde_json::json!({"command": "rm -rf /tmp/x"}))], ""),
            make_text_response("I did not delete anything because the command was not approved."),
        ]));
        let tools = Arc::new(ScriptedExecutor::new());
        tools.script("shell", vec![Ok(ToolOutput::ok("deleted"))]);
        let agent = Arc::new(agent(&h, provider, tools.clone()));
        let mut req = request(10);
        req.snapshot.approval_required = vec!["shell".into()];

        let task = tokio::spawn({
            let agent = agent.clone();
            async move { agent.run(req).await }
        });

        let approval_id = loop {
            let event = h.events.recv().await.unwrap();
            if let Some(pending) = &event.pending_approval {
                assert_eq!(pending.tool_name, "shell");
                break pending.approval_id.clone();
            }
        };
        assert!(agent.approvals().respond(&approval_id, false));

        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome.status, TerminalState::Completed);
        assert_eq!(tools.calls("shell"), 0);
        let tool_turn = &outcome.conversation.messages[2];
        assert!(tool_turn.content.contains("denied by user"));
    }

    #[tokio::test(start_paused = true)]
    async fn permission_failure_asks_for_wrap_up() {
        let h = harness();
        let provider = Arc::new(SequentialMockProvider::new(vec![
            make_tool_call_response(vec![make_tool_call("shell", serde_json::json!({}))], ""),
            make_text_response("I could not read the file: access was denied."),
        ]));
        let tools = Arc::new(ScriptedExecutor::new());
        tools.script("shell", vec![Ok(ToolOutput::error("Permission denied: shell: rm not allowed"))]);
        let agent = agent(&h, provider, tools);

        let outcome = agent.run(request(10)).await.unwrap();

        assert_eq!(outcome.status, TerminalState::Completed);
        let wrap_up = &outcome.conversation.messages[3];
        assert_eq!(wrap_up.role, Role::User);
        assert_eq!(wrap_up.content, prompt::WRAP_UP_INSTRUCTION);
    }

    #[tokio::test(start_paused = true)]
    async fn completion_signal_with_tool_calls_ends_run() {
        let h = harness();
        let mut response = make_tool_call_response(
            vec![make_tool_call("echo", serde_json::json!({}))],
            "Saved the report to report.md.",
        );
        response.needs_more_work = Some(false);
        let provider = Arc::new(SequentialMockProvider::new(vec![response]));
        let tools = Arc::new(ScriptedExecutor::new());
        tools.script("echo", vec![Ok(ToolOutput::ok("written"))]);
        let agent = agent(&h, provider.clone(), tools);

        let outcome = agent.run(request(10)).await.unwrap();

        assert_eq!(outcome.status, TerminalState::Completed);
        assert_eq!(outcome.final_content, "Saved the report to report.md.");
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn persisted_conversation_matches_outcome() {
        let h = harness();
        let store = agentrail_store::InMemoryStore::new();
        let (persistence, _worker) = PersistenceHandle::spawn(Arc::new(store.clone()));
        let provider = Arc::new(SequentialMockProvider::single_text("The answer is 42."));
        let agent = agent(&h, provider, Arc::new(ScriptedExecutor::new())).with_persistence(persistence.clone());

        let outcome = agent.run(request(10)).await.unwrap();
        persistence.flush().await;

        assert_eq!(store.len(&outcome.conversation_id).await, outcome.conversation.messages.len());
    }

    /// A store whose writes never finish.
    struct StalledStore;

    #[async_trait::async_trait]
    impl agentrail_core::ConversationStore for StalledStore {
        fn name(&self) -> &str {
            "stalled"
        }

        async fn append_message(
            &self,
            _conversation_id: &agentrail_core::ConversationId,
            _message: &Message,
        ) -> Result<(), agentrail_core::error::StoreError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }

        async fn load(
            &self,
            _conversation_id: &agentrail_core::ConversationId,
        ) -> Result<Vec<Message>, agentrail_core::error::StoreError> {
            Ok(Vec::new())
        }

        async fn list(&self) -> Result<Vec<agentrail_core::ConversationId>, agentrail_core::error::StoreError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_store_does_not_hold_up_the_run() {
        let h = harness();
        let (persistence, _worker) = PersistenceHandle::spawn(Arc::new(StalledStore));
        let provider = Arc::new(SequentialMockProvider::single_text("The answer is 42."));
        let agent = agent(&h, provider, Arc::new(ScriptedExecutor::new())).with_persistence(persistence);

        let outcome = tokio::time::timeout(Duration::from_secs(60), agent.run(request(10)))
            .await
            .expect("run must not wait on the store")
            .unwrap();

        assert_eq!(outcome.status, TerminalState::Completed);
        assert!(!h.registry.contains("s1"));
    }
}
