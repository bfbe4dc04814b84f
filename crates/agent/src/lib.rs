//! The agent loop and its control surface.
//!
//! A run follows a **Call → Act → Gate** cycle:
//!
//! 1. **Prepare** the conversation (system prompt, active tools, token budget)
//! 2. **Call** the model, racing the session's cancellation token
//! 3. **If tool calls**: execute them (with retry, in parallel where allowed),
//!    append one tool-result turn, loop back to step 1
//! 4. **If text**: pass it through the completion gate, which either accepts
//!    it, sends the model back to work, or ends the run as incomplete
//!
//! Every run ends in exactly one terminal state, publishes exactly one
//! terminal progress event, and releases its session state once.

pub mod approval;
pub mod broadcast;
pub mod context;
pub mod deliverable;
pub mod executor;
pub mod gate;
pub mod loop_runner;
pub mod persist;
pub mod progress;
pub mod prompt;
pub mod runtime;
pub mod session;
pub mod verifier;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use approval::ApprovalRegistry;
pub use broadcast::ProgressBroadcaster;
pub use context::BudgetShrinker;
pub use deliverable::{CandidateClass, DeliverableHeuristics, classify_candidate};
pub use executor::{
    ExecutionMode, RetryPolicy, ToolExecutionEngine, ToolExecutionResult, ToolFailureTracker, is_permission_error,
    is_retryable_error,
};
pub use gate::{GateDecision, GateLimits, VerificationGate};
pub use loop_runner::{AgentLoop, LoopSettings, RunOutcome, RunRequest, TerminalState};
pub use persist::PersistenceHandle;
pub use runtime::{AgentRuntime, SessionStatus, StopAllReport};
pub use session::{SessionRegistry, SessionState};
pub use verifier::ModelVerifier;
