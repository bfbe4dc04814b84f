//! Verification gate: decides whether a candidate answer ends the run.
//!
//! ```text
//!   candidate ──screen──▶ not deliverable ──▶ Continue (nudge) / ForceIncomplete (nudges spent)
//!       │
//!       └─ deliverable ──verify──▶ complete     ──▶ Accept
//!                                  incomplete   ──▶ Continue (missing items)
//!                                  5th failure  ──▶ ForceIncomplete
//! ```
//!
//! The gate is synchronous; the loop performs the verifier call and feeds the
//! verdict back in.

use agentrail_core::Verdict;
use tracing::{debug, warn};

use crate::deliverable::{CandidateClass, DeliverableHeuristics};
use crate::prompt;

/// What the loop does with a candidate answer.
#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    /// Finalize with this content.
    Accept { content: String },
    /// Push the instruction and keep iterating.
    Continue { instruction: String },
    /// Run the verifier on the candidate.
    Verify,
    /// Stop, labelled incomplete, with a synthesized explanation.
    ForceIncomplete { content: String },
}

#[derive(Debug, Clone, Copy)]
pub struct GateLimits {
    /// Consecutive failed verifications that force an incomplete result
    pub max_verification_failures: u32,
    /// Consecutive failures after which the "use tools directly" nudge fires
    pub tool_nudge_after: u32,
    /// Corrective nudges for non-deliverable answers
    pub max_nudges: u32,
    /// Whether deliverable answers go through the verifier at all
    pub verify: bool,
}

impl Default for GateLimits {
    fn default() -> Self {
        Self {
            max_verification_failures: 5,
            tool_nudge_after: 2,
            max_nudges: 3,
            verify: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VerificationGate {
    limits: GateLimits,
    heuristics: DeliverableHeuristics,
    consecutive_failures: u32,
    verifier_calls: u32,
    nudges_sent: u32,
    tool_nudge_sent: bool,
    last_missing: Vec<String>,
    last_reason: Option<String>,
}

impl VerificationGate {
    pub fn new(limits: GateLimits, heuristics: DeliverableHeuristics) -> Self {
        Self {
            limits,
            heuristics,
            consecutive_failures: 0,
            verifier_calls: 0,
            nudges_sent: 0,
            tool_nudge_sent: false,
            last_missing: Vec::new(),
            last_reason: None,
        }
    }

    /// First stage: reject empty, placeholder and status-update answers.
    pub fn screen(&mut self, candidate: &str) -> GateDecision {
        let class = self.heuristics.classify(candidate);
        if class.is_deliverable() {
            if self.limits.verify {
                return GateDecision::Verify;
            }
            return GateDecision::Accept {
                content: candidate.trim().to_string(),
            };
        }

        if self.nudges_sent >= self.limits.max_nudges {
            warn!(?class, nudges = self.nudges_sent, "No deliverable answer after nudges");
            return GateDecision::ForceIncomplete {
                content: prompt::no_progress_fallback(candidate),
            };
        }

        self.nudges_sent += 1;
        debug!(?class, nudges = self.nudges_sent, "Rejected non-deliverable answer");
        GateDecision::Continue {
            instruction: prompt::nondeliverable_instruction(class),
        }
    }

    /// Second stage: fold a verifier outcome into the gate.
    ///
    /// `Err` carries the error text of a verifier call that failed after its
    /// own retries; it counts as a failed verification.
    pub fn record_verdict(
        &mut self,
        candidate: &str,
        verdict: Result<Verdict, String>,
        tools_used: bool,
    ) -> GateDecision {
        self.verifier_calls += 1;

        let verdict = match verdict {
            Ok(v) if v.is_complete => {
                self.consecutive_failures = 0;
                return GateDecision::Accept {
                    content: candidate.trim().to_string(),
                };
            }
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Verifier failed");
                Verdict::incomplete(self.last_missing.clone(), format!("verification failed: {e}"))
            }
        };

        self.consecutive_failures += 1;
        if !verdict.missing_items.is_empty() {
            self.last_missing = verdict.missing_items.clone();
        }
        self.last_reason = Some(verdict.reason.clone());

        if self.consecutive_failures >= self.limits.max_verification_failures {
            warn!(
                failures = self.consecutive_failures,
                "Verification budget exhausted, forcing incomplete result"
            );
            return GateDecision::ForceIncomplete {
                content: prompt::incomplete_explanation(candidate, &self.last_missing),
            };
        }

        let mut instruction = prompt::verification_instruction(&verdict.missing_items, &verdict.reason);
        if self.consecutive_failures >= self.limits.tool_nudge_after && !tools_used && !self.tool_nudge_sent {
            self.tool_nudge_sent = true;
            instruction.push_str("\n\n");
            instruction.push_str(prompt::USE_TOOLS_NUDGE);
        }
        GateDecision::Continue { instruction }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn verifier_calls(&self) -> u32 {
        self.verifier_calls
    }

    pub fn nudges_sent(&self) -> u32 {
        self.nudges_sent
    }

    pub fn last_missing(&self) -> &[String] {
        &self.last_missing
    }

    pub fn classify(&self, candidate: &str) -> CandidateClass {
        self.heuristics.classify(candidate)
    }
}
