//! Prompt text: system prompt, tool listing, corrective nudges and the
//! fallback messages used by terminal states.

use agentrail_core::{SessionSnapshot, ToolDefinition};

use crate::deliverable::CandidateClass;
use crate::executor::ToolExecutionResult;

/// Content recorded for a successful tool call that printed nothing.
pub const NO_OUTPUT: &str = "[No output]";

const BASE_PROMPT: &str = "You are an autonomous agent. Work toward the user's request by calling the \
available tools, observing their results, and calling more tools as needed. When the request is fully \
satisfied, reply with the final answer itself, not a description of what you are about to do. \
If you reply with JSON, use {\"content\": \"<answer>\", \"needsMoreWork\": false} to signal completion.";

pub const USE_TOOLS_NUDGE: &str = "Use the tools directly. Do not describe tool calls in prose; \
invoke the tool and wait for its result.";

pub const EMPTY_RESPONSE_NUDGE: &str = "Your previous response was empty. Continue with the task: \
call a tool or give the final answer.";

pub const EMPTY_RESPONSE_FALLBACK: &str = "I stopped because the model returned repeated empty responses. \
Please try again or rephrase the request.";

pub const WRAP_UP_INSTRUCTION: &str = "Some tools failed with permission or authentication errors. \
Do not retry them. Wrap up: give the best answer you can with the information gathered so far and \
explain what could not be done.";

pub const ABORTED_MESSAGE: &str = "(Agent mode was stopped by emergency kill switch)";

/// Why a run hit its iteration bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetReason {
    /// Tools kept failing until some were withdrawn.
    RepeatedFailures,
    IterationLimit,
}

/// Build the system prompt for one iteration.
pub fn build_system_prompt(snapshot: &SessionSnapshot, tools: &[ToolDefinition]) -> String {
    let mut prompt = String::from(BASE_PROMPT);
    prompt.push_str("\n\n");
    prompt.push_str(&tool_listing(tools));
    if !snapshot.guidelines.trim().is_empty() {
        prompt.push_str("\n\n## Guidelines\n");
        prompt.push_str(snapshot.guidelines.trim());
    }
    prompt
}

/// The "available tools" section. Regenerated whenever the active set changes.
pub fn tool_listing(tools: &[ToolDefinition]) -> String {
    if tools.is_empty() {
        return "## Available tools\nNo tools are available. Answer directly.".into();
    }
    let mut listing = String::from("## Available tools\n");
    for tool in tools {
        listing.push_str(&format!("- {}: {}\n", tool.name, tool.description));
    }
    listing.trim_end().to_string()
}

/// Text of the tool-result turn for one batch.
pub fn summarize_tool_results(results: &[ToolExecutionResult]) -> String {
    results
        .iter()
        .map(|r| {
            if r.cancelled {
                format!("[{}] cancelled before completion", r.call.name)
            } else if r.result.success {
                let content = if r.result.content.trim().is_empty() {
                    NO_OUTPUT
                } else {
                    r.result.content.as_str()
                };
                format!("[{}] {}", r.call.name, content)
            } else {
                let error = r.result.error.as_deref().unwrap_or(&r.result.content);
                format!("[{}] FAILED: {}", r.call.name, error)
            }
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub fn nondeliverable_instruction(class: CandidateClass) -> String {
    let problem = match class {
        CandidateClass::Empty => "Your last reply was empty.",
        CandidateClass::Placeholder => "Your last reply was a placeholder, not an answer.",
        CandidateClass::StatusUpdate => "Your last reply described what you are about to do instead of doing it.",
        CandidateClass::Deliverable => "Your last reply was not accepted.",
    };
    format!("{problem} If more work is needed, call the tools now. Otherwise reply with the complete final answer.")
}

pub fn verification_instruction(missing: &[String], reason: &str) -> String {
    let mut text = String::from("The request is not complete yet.");
    if !reason.trim().is_empty() {
        text.push(' ');
        text.push_str(reason.trim());
    }
    if !missing.is_empty() {
        text.push_str("\nStill missing:\n");
        for item in missing {
            text.push_str(&format!("- {item}\n"));
        }
    }
    text.push_str("\nContinue working until every item is done, then give the final answer.");
    text
}

/// Final text when the verification budget is exhausted.
pub fn incomplete_explanation(candidate: &str, missing: &[String]) -> String {
    let mut text = String::new();
    if !candidate.trim().is_empty() {
        text.push_str(candidate.trim());
        text.push_str("\n\n");
    }
    text.push_str("Note: this task may be incomplete. Verification did not confirm completion");
    if missing.is_empty() {
        text.push('.');
    } else {
        text.push_str(". Items that still appear to be missing:\n");
        for item in missing {
            text.push_str(&format!("- {item}\n"));
        }
    }
    text.trim_end().to_string()
}

/// Final text when the model never produced a deliverable answer.
pub fn no_progress_fallback(candidate: &str) -> String {
    let candidate = candidate.trim();
    if candidate.is_empty() {
        "I was unable to produce a final answer for this request.".into()
    } else {
        format!("{candidate}\n\nNote: I was unable to produce a complete final answer for this request.")
    }
}

/// Final text when the iteration budget runs out.
pub fn budget_exhausted_message(last_assistant: Option<&str>, max_iterations: u32, reason: BudgetReason) -> String {
    let note = match reason {
        BudgetReason::RepeatedFailures => {
            format!("Stopped after {max_iterations} iterations because tools kept failing.")
        }
        BudgetReason::IterationLimit => {
            format!("Stopped after reaching the maximum of {max_iterations} iterations.")
        }
    };
    match last_assistant.map(str::trim).filter(|s| !s.is_empty()) {
        Some(last) => format!("{last}\n\n({note})"),
        None => format!("I could not finish this request. {note} Please provide further guidance."),
    }
}
