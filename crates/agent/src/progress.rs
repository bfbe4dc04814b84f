//! Per-run progress tracking: keeps the bounded list of recent steps and
//! turns every change into a [`ProgressEvent`] for the broadcaster.

use agentrail_core::progress::{PendingApproval, RetryInfo, StreamingContent};
use agentrail_core::{ProgressEvent, ProgressStep, StepStatus, StepType, ToolCall, ToolProgress};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::broadcast::ProgressBroadcaster;
use crate::executor::{ExecutionHooks, ToolExecutionResult};

/// Longest tool output echoed into a step.
const STEP_CONTENT_CHARS: usize = 500;

struct Inner {
    broadcaster: Arc<ProgressBroadcaster>,
    session_id: String,
    conversation_id: String,
    max_iterations: u32,
    max_steps: usize,
    iteration: AtomicU32,
    steps: Mutex<VecDeque<ProgressStep>>,
}

#[derive(Clone)]
pub struct RunProgress {
    inner: Arc<Inner>,
}

impl RunProgress {
    pub fn new(
        broadcaster: Arc<ProgressBroadcaster>,
        session_id: impl Into<String>,
        conversation_id: impl Into<String>,
        max_iterations: u32,
        max_steps: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                broadcaster,
                session_id: session_id.into(),
                conversation_id: conversation_id.into(),
                max_iterations,
                max_steps: max_steps.max(1),
                iteration: AtomicU32::new(0),
                steps: Mutex::new(VecDeque::new()),
            }),
        }
    }

    pub fn set_iteration(&self, iteration: u32) {
        self.inner.iteration.store(iteration, Ordering::SeqCst);
    }

    pub fn iteration(&self) -> u32 {
        self.inner.iteration.load(Ordering::SeqCst)
    }

    /// Append a step and emit.
    pub fn push_step(&self, step: ProgressStep) {
        self.record(step);
        self.emit(self.snapshot());
    }

    /// Modify the step with `id` in place and emit. Unknown ids are ignored.
    pub fn update_step(&self, id: &str, update: impl FnOnce(&mut ProgressStep)) {
        let found = {
            let mut steps = self.steps();
            match steps.iter_mut().rev().find(|s| s.id == id) {
                Some(step) => {
                    update(step);
                    true
                }
                None => false,
            }
        };
        if found {
            self.emit(self.snapshot());
        }
    }

    /// Emit the partial text of a streaming model call.
    pub fn stream_text(&self, text: &str) {
        let mut event = self.snapshot();
        event.streaming_content = Some(StreamingContent {
            text: text.to_string(),
            is_streaming: true,
        });
        self.emit(event);
    }

    /// Record an approval step and emit it with the pending approval attached.
    pub fn awaiting_approval(&self, step_id: &str, approval_id: &str, call: &ToolCall) {
        self.record(
            step(step_id, StepType::ToolCall, format!("Approve {}?", call.name), StepStatus::AwaitingApproval)
                .with_tool_call(call.name.clone(), call.arguments.clone()),
        );
        let mut event = self.snapshot();
        event.pending_approval = Some(PendingApproval {
            approval_id: approval_id.to_string(),
            tool_name: call.name.clone(),
            arguments: call.arguments.clone(),
        });
        self.emit(event);
    }

    /// Deliver the terminal event, bypassing throttling.
    pub fn finish(&self, final_content: &str, succeeded: bool, summary: &str) {
        let status = if succeeded {
            StepStatus::Completed
        } else {
            StepStatus::Error
        };
        self.record(
            step(
                &format!("done-{}", self.iteration()),
                StepType::Completion,
                summary.to_string(),
                status,
            )
            .with_llm_content(final_content.to_string()),
        );
        let mut event = self.snapshot();
        event.is_complete = true;
        event.final_content = Some(final_content.to_string());
        self.inner.broadcaster.force_emit(event);
    }

    /// Current state as an event.
    pub fn snapshot(&self) -> ProgressEvent {
        let mut event = ProgressEvent::new(
            self.inner.session_id.clone(),
            self.iteration(),
            self.inner.max_iterations,
        );
        event.conversation_id = Some(self.inner.conversation_id.clone());
        event.steps = self.steps().iter().cloned().collect();
        event
    }

    fn emit(&self, event: ProgressEvent) {
        self.inner.broadcaster.emit(event);
    }

    fn record(&self, step: ProgressStep) {
        let mut steps = self.steps();
        steps.push_back(step);
        while steps.len() > self.inner.max_steps {
            steps.pop_front();
        }
    }

    fn steps(&self) -> MutexGuard<'_, VecDeque<ProgressStep>> {
        match self.inner.steps.lock() {
            Ok(steps) => steps,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn tool_step_id(&self, index: usize) -> String {
        format!("tool-{}-{}", self.iteration(), index)
    }
}

/// A step with a caller-chosen id.
pub fn step(id: &str, step_type: StepType, title: impl Into<String>, status: StepStatus) -> ProgressStep {
    let mut step = ProgressStep::new(step_type, title, status);
    step.id = id.to_string();
    step
}

fn clip(text: &str) -> String {
    match text.char_indices().nth(STEP_CONTENT_CHARS) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

impl ExecutionHooks for RunProgress {
    fn on_start(&self, index: usize, call: &ToolCall) {
        self.push_step(
            step(
                &self.tool_step_id(index),
                StepType::ToolCall,
                format!("Running {}", call.name),
                StepStatus::InProgress,
            )
            .with_tool_call(call.name.clone(), call.arguments.clone()),
        );
    }

    fn on_retry(&self, index: usize, info: RetryInfo) {
        let id = self.tool_step_id(index);
        {
            let mut steps = self.steps();
            if let Some(step) = steps.iter_mut().rev().find(|s| s.id == id) {
                step.description = Some(format!(
                    "Retry {}/{} in {}ms: {}",
                    info.attempt, info.max_retries, info.delay_ms, info.reason
                ));
            }
        }
        let mut event = self.snapshot();
        event.retry_info = Some(info);
        self.emit(event);
    }

    fn on_finish(&self, index: usize, result: &ToolExecutionResult) {
        let success = result.result.success;
        self.update_step(&self.tool_step_id(index), |step| {
            step.step_type = StepType::ToolResult;
            step.status = if success {
                StepStatus::Completed
            } else {
                StepStatus::Error
            };
            step.title = if success {
                format!("{} finished", result.call.name)
            } else {
                format!("{} failed", result.call.name)
            };
            step.tool_result = Some(agentrail_core::progress::StepToolResult {
                success,
                content: clip(&result.result.content),
                error: result.result.error.clone(),
            });
        });
    }

    fn progress_for(&self, index: usize, _call: &ToolCall) -> Option<ToolProgress> {
        let tracker = self.clone();
        let id = self.tool_step_id(index);
        Some(Arc::new(move |output: &str| {
            let line = output.lines().last().unwrap_or_default().to_string();
            tracker.update_step(&id, |step| step.description = Some(clip(&line)));
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionRegistry;
    use crate::test_helpers::make_tool_call;
    use agentrail_core::{ProgressBus, SessionSnapshot, ToolResult};
    use std::time::Duration;
    use tokio::sync::broadcast::Receiver;

    fn setup(max_steps: usize) -> (RunProgress, Receiver<Arc<ProgressEvent>>) {
        let bus = Arc::new(ProgressBus::new(64));
        let rx = bus.subscribe();
        let registry = Arc::new(SessionRegistry::new());
        registry.create("s1", SessionSnapshot::new("mock", "m", 10));
        let broadcaster = Arc::new(ProgressBroadcaster::new(bus, registry, Duration::from_millis(150)));
        (RunProgress::new(broadcaster, "s1", "c1", 10, max_steps), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn steps_are_bounded() {
        let (progress, _rx) = setup(3);
        for i in 0..5 {
            progress.push_step(step(&format!("s{i}"), StepType::Thinking, "t", StepStatus::Completed));
        }
        let ids: Vec<String> = progress.snapshot().steps.into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["s2", "s3", "s4"]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_tool_emits_error_step_immediately() {
        let (progress, mut rx) = setup(20);
        progress.set_iteration(2);
        let call = make_tool_call("shell", serde_json::json!({"command": "ls"}));
        progress.on_start(0, &call);
        let first = rx.try_recv().unwrap();
        assert_eq!(first.steps[0].id, "tool-2-0");
        assert_eq!(first.conversation_id.as_deref(), Some("c1"));

        let failed = ToolExecutionResult {
            call: call.clone(),
            result: ToolResult::failure("call_shell", "Permission denied"),
            retry_count: 0,
            cancelled: false,
        };
        progress.on_finish(0, &failed);
        let event = rx.try_recv().unwrap();
        let last = event.steps.last().unwrap();
        assert_eq!(last.status, StepStatus::Error);
        assert_eq!(last.step_type, StepType::ToolResult);
        assert!(!last.tool_result.as_ref().unwrap().success);
    }

    #[tokio::test(start_paused = true)]
    async fn finish_is_terminal_and_unthrottled() {
        let (progress, mut rx) = setup(20);
        progress.push_step(step("a", StepType::Thinking, "t", StepStatus::InProgress));
        progress.push_step(step("b", StepType::Thinking, "t", StepStatus::InProgress));
        progress.finish("All done", true, "Completed");

        let events: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        let last = events.last().unwrap();
        assert!(last.is_complete);
        assert_eq!(last.final_content.as_deref(), Some("All done"));
        assert_eq!(last.steps.last().unwrap().step_type, StepType::Completion);
    }

    #[test]
    fn clip_limits_length() {
        let long = "x".repeat(STEP_CONTENT_CHARS + 10);
        assert_eq!(clip(&long).chars().count(), STEP_CONTENT_CHARS + 3);
        assert_eq!(clip("short"), "short");
    }
}
