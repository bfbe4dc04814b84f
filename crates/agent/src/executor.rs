//! Tool execution engine: runs a batch of tool calls with bounded retry and
//! cooperative cancellation, sequentially or in parallel.
//!
//! Every call races against the session's cancellation token. When the token
//! wins, the in-flight future is dropped and its eventual result is never
//! observed. Parallel batches return results in input order.

use agentrail_core::progress::RetryInfo;
use agentrail_core::{ToolCall, ToolExecutor, ToolProgress, ToolResult};
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Error text fragments that mark a failure as transient.
const RETRYABLE_KEYWORDS: &[&str] = &["timeout", "timed out", "connection", "network", "temporary", "busy"];

/// Error text fragments that mark a permission or authentication failure.
const PERMISSION_KEYWORDS: &[&str] = &[
    "permission denied",
    "not permitted",
    "unauthorized",
    "forbidden",
    "access denied",
    "authentication",
    "not authorized",
];

/// Whether an error message describes a transient failure worth retrying.
pub fn is_retryable_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    RETRYABLE_KEYWORDS.iter().any(|k| lower.contains(k))
}

/// Whether an error message describes a permission/authentication failure.
pub fn is_permission_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    PERMISSION_KEYWORDS.iter().any(|k| lower.contains(k))
}

/// How a batch is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Sequential,
    Parallel,
}

impl ExecutionMode {
    /// Parallel for multi-call batches unless concurrency is disabled.
    pub fn for_batch(len: usize, parallel_enabled: bool) -> Self {
        if len > 1 && parallel_enabled {
            Self::Parallel
        } else {
            Self::Sequential
        }
    }
}

/// Retry budget and exponential backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff_base: Duration) -> Self {
        Self {
            max_retries,
            backoff_base,
        }
    }

    /// Wait before retry number `attempt` (1-based): base * 2^attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base.saturating_mul(2u32.saturating_pow(attempt))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(2, Duration::from_secs(1))
    }
}

/// A tool call paired with its final outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolExecutionResult {
    pub call: ToolCall,
    pub result: ToolResult,
    /// Retries actually consumed
    pub retry_count: u32,
    /// The attempt was cut short by cancellation
    pub cancelled: bool,
}

impl ToolExecutionResult {
    pub(crate) fn cancelled(call: &ToolCall, retry_count: u32) -> Self {
        Self {
            call: call.clone(),
            result: ToolResult::failure(call.id.clone(), "Tool call cancelled"),
            retry_count,
            cancelled: true,
        }
    }

    pub fn failed(call: &ToolCall, error: impl Into<String>) -> Self {
        Self {
            call: call.clone(),
            result: ToolResult::failure(call.id.clone(), error),
            retry_count: 0,
            cancelled: false,
        }
    }
}

/// Results of one batch, in input order.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub results: Vec<ToolExecutionResult>,
    /// Cancellation was observed on at least one call
    pub cancelled: bool,
}

/// Observation points around each call. All methods default to no-ops.
pub trait ExecutionHooks: Send + Sync {
    fn on_start(&self, _index: usize, _call: &ToolCall) {}

    fn on_retry(&self, _index: usize, _info: RetryInfo) {}

    fn on_finish(&self, _index: usize, _result: &ToolExecutionResult) {}

    /// Sink for incremental output of the call at `index`.
    fn progress_for(&self, _index: usize, _call: &ToolCall) -> Option<ToolProgress> {
        None
    }
}

/// Hooks that observe nothing.
pub struct NoHooks;

impl ExecutionHooks for NoHooks {}

pub struct ToolExecutionEngine {
    executor: Arc<dyn ToolExecutor>,
    policy: RetryPolicy,
}

impl ToolExecutionEngine {
    pub fn new(executor: Arc<dyn ToolExecutor>, policy: RetryPolicy) -> Self {
        Self { executor, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Execute a batch.
    pub async fn execute_batch(
        &self,
        calls: &[ToolCall],
        mode: ExecutionMode,
        cancel: &CancellationToken,
        hooks: &dyn ExecutionHooks,
    ) -> BatchOutcome {
        debug!(count = calls.len(), ?mode, "Executing tool batch");

        let results = match mode {
            ExecutionMode::Parallel => {
                join_all(
                    calls
                        .iter()
                        .enumerate()
                        .map(|(index, call)| self.execute_one(index, call, cancel, hooks)),
                )
                .await
            }
            ExecutionMode::Sequential => {
                let mut results = Vec::with_capacity(calls.len());
                for (index, call) in calls.iter().enumerate() {
                    if cancel.is_cancelled() {
                        results.push(ToolExecutionResult::cancelled(call, 0));
                        continue;
                    }
                    results.push(self.execute_one(index, call, cancel, hooks).await);
                }
                results
            }
        };

        let cancelled = results.iter().any(|r| r.cancelled);
        if cancelled {
            info!(count = calls.len(), "Tool batch cut short by cancellation");
        }
        BatchOutcome { results, cancelled }
    }

    /// Execute one call with retry, racing each attempt and each backoff
    /// against cancellation.
    pub async fn execute_one(
        &self,
        index: usize,
        call: &ToolCall,
        cancel: &CancellationToken,
        hooks: &dyn ExecutionHooks,
    ) -> ToolExecutionResult {
        hooks.on_start(index, call);
        let progress = hooks.progress_for(index, call);
        let mut retries = 0;

        let outcome = loop {
            if cancel.is_cancelled() {
                return ToolExecutionResult::cancelled(call, retries);
            }

            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(tool = %call.name, "Abandoning in-flight tool call");
                    return ToolExecutionResult::cancelled(call, retries);
                }
                r = self.executor.execute(call, progress.clone()) => r,
            };

            let error = match attempt {
                Ok(output) if !output.is_error => {
                    break ToolExecutionResult {
                        call: call.clone(),
                        result: ToolResult::success(call.id.clone(), output.content),
                        retry_count: retries,
                        cancelled: false,
                    };
                }
                Ok(output) => output.content,
                Err(e) => e.to_string(),
            };

            if retries < self.policy.max_retries && is_retryable_error(&error) {
                retries += 1;
                let delay = self.policy.backoff(retries);
                warn!(
                    tool = %call.name,
                    attempt = retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Transient tool failure, retrying"
                );
                hooks.on_retry(
                    index,
                    RetryInfo {
                        tool_name: call.name.clone(),
                        attempt: retries,
                        max_retries: self.policy.max_retries,
                        delay_ms: delay.as_millis() as u64,
                        reason: error,
                    },
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return ToolExecutionResult::cancelled(call, retries),
                    _ = tokio::time::sleep(delay) => {}
                }
                continue;
            }

            warn!(tool = %call.name, retries, error = %error, "Tool call failed");
            break ToolExecutionResult {
                call: call.clone(),
                result: ToolResult::failure(call.id.clone(), error),
                retry_count: retries,
                cancelled: false,
            };
        };

        hooks.on_finish(index, &outcome);
        outcome
    }
}

/// Per-run failure counts by tool name. Tools that reach the threshold are
/// withdrawn from the active tool set.
#[derive(Debug, Clone)]
pub struct ToolFailureTracker {
    threshold: u32,
    failures: HashMap<String, u32>,
    excluded: HashSet<String>,
}

impl ToolFailureTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            failures: HashMap::new(),
            excluded: HashSet::new(),
        }
    }

    /// Count a failure. Returns true when this failure excludes the tool.
    pub fn record_failure(&mut self, tool: &str) -> bool {
        let count = self.failures.entry(tool.to_string()).or_insert(0);
        *count += 1;
        if *count >= self.threshold && self.excluded.insert(tool.to_string()) {
            warn!(tool, failures = *count, "Excluding tool after repeated failures");
            return true;
        }
        false
    }

    pub fn failures(&self, tool: &str) -> u32 {
        self.failures.get(tool).copied().unwrap_or(0)
    }

    pub fn is_excluded(&self, tool: &str) -> bool {
        self.excluded.contains(tool)
    }

    pub fn excluded(&self) -> impl Iterator<Item = &str> {
        self.excluded.iter().map(String::as_str)
    }

    pub fn has_exclusions(&self) -> bool {
        !self.excluded.is_empty()
    }
}
