//! Shared test doubles for the agent crate.

use agentrail_core::error::{ProviderError, ToolError};
use agentrail_core::provider::Usage;
use agentrail_core::{
    Message, Provider, ProviderRequest, ProviderResponse, ToolCall, ToolDefinition, ToolExecutor, ToolOutput,
    ToolProgress, Verdict, Verifier,
};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// A mock provider that returns a sequence of scripted responses.
///
/// Each call to `complete` returns the next entry. Once the script runs out
/// the last entry repeats.
pub struct SequentialMockProvider {
    responses: Mutex<Vec<Result<ProviderResponse, ProviderError>>>,
    requests: Mutex<Vec<ProviderRequest>>,
    delay: Option<Duration>,
}

impl SequentialMockProvider {
    pub fn new(responses: Vec<ProviderResponse>) -> Self {
        Self::with_results(responses.into_iter().map(Ok).collect())
    }

    pub fn with_results(responses: Vec<Result<ProviderResponse, ProviderError>>) -> Self {
        assert!(!responses.is_empty(), "script at least one response");
        Self {
            responses: Mutex::new(responses),
            requests: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// Create a provider that returns a single text response (no tool calls).
    pub fn single_text(text: &str) -> Self {
        Self::new(vec![make_text_response(text)])
    }

    /// Sleep this long inside every `complete` call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Tool names offered on the `n`th call (0-based).
    pub fn offered_tools(&self, n: usize) -> Vec<String> {
        self.requests.lock().unwrap()[n].tools.iter().map(|t| t.name.clone()).collect()
    }
}

#[async_trait::async_trait]
impl Provider for SequentialMockProvider {
    fn name(&self) -> &str {
        "sequential_mock"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let next = {
            let mut requests = self.requests.lock().unwrap();
            let responses = self.responses.lock().unwrap();
            let index = requests.len().min(responses.len() - 1);
            requests.push(request);
            responses[index].clone()
        };
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        next
    }
}

/// Create a simple text response (no tool calls).
pub fn make_text_response(text: &str) -> ProviderResponse {
    ProviderResponse {
        message: Message::assistant(text),
        usage: Some(Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        }),
        model: "mock-model".into(),
        needs_more_work: None,
    }
}

/// Create a response with tool calls and optional thought content.
pub fn make_tool_call_response(tool_calls: Vec<ToolCall>, thought: &str) -> ProviderResponse {
    ProviderResponse {
        message: Message::assistant_with_tool_calls(thought, tool_calls),
        usage: Some(Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        }),
        model: "mock-model".into(),
        needs_more_work: None,
    }
}

/// Helper to create a tool call.
pub fn make_tool_call(name: &str, args: serde_json::Value) -> ToolCall {
    ToolCall {
        id: format!("call_{name}"),
        name: name.to_string(),
        arguments: args,
    }
}

pub fn make_tool_definition(name: &str) -> ToolDefinition {
    ToolDefinition {
        name: name.to_string(),
        description: format!("The {name} tool"),
        parameters: serde_json::json!({ "type": "object" }),
    }
}

struct Script {
    delay: Option<Duration>,
    outputs: Vec<Result<ToolOutput, ToolError>>,
    calls: usize,
}

/// A tool executor whose tools return scripted outputs. Unknown tools fail
/// with `ToolError::NotFound`. Exhausted scripts repeat their last output.
#[derive(Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<String, Script>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, name: &str, outputs: Vec<Result<ToolOutput, ToolError>>) {
        self.insert(name, None, outputs);
    }

    pub fn script_delayed(&self, name: &str, delay: Duration, outputs: Vec<Result<ToolOutput, ToolError>>) {
        self.insert(name, Some(delay), outputs);
    }

    fn insert(&self, name: &str, delay: Option<Duration>, outputs: Vec<Result<ToolOutput, ToolError>>) {
        assert!(!outputs.is_empty(), "script at least one output");
        self.scripts.lock().unwrap().insert(
            name.to_string(),
            Script {
                delay,
                outputs,
                calls: 0,
            },
        );
    }

    pub fn calls(&self, name: &str) -> usize {
        self.scripts.lock().unwrap().get(name).map_or(0, |s| s.calls)
    }
}

#[async_trait::async_trait]
impl ToolExecutor for ScriptedExecutor {
    fn definitions(&self) -> Vec<ToolDefinition> {
        let mut names: Vec<String> = self.scripts.lock().unwrap().keys().cloned().collect();
        names.sort();
        names.iter().map(|n| make_tool_definition(n)).collect()
    }

    async fn execute(&self, call: &ToolCall, _progress: Option<ToolProgress>) -> Result<ToolOutput, ToolError> {
        let (delay, output) = {
            let mut scripts = self.scripts.lock().unwrap();
            let Some(script) = scripts.get_mut(&call.name) else {
                return Err(ToolError::NotFound(call.name.clone()));
            };
            let index = script.calls.min(script.outputs.len() - 1);
            script.calls += 1;
            (script.delay, script.outputs[index].clone())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        output
    }
}

/// A verifier that returns scripted verdicts, repeating the last one.
pub struct ScriptedVerifier {
    verdicts: Vec<Verdict>,
    calls: Mutex<usize>,
}

impl ScriptedVerifier {
    pub fn new(verdicts: Vec<Verdict>) -> Self {
        assert!(!verdicts.is_empty(), "script at least one verdict");
        Self {
            verdicts,
            calls: Mutex::new(0),
        }
    }

    pub fn always_complete() -> Self {
        Self::new(vec![Verdict::complete("done")])
    }

    pub fn always_incomplete(missing: &str) -> Self {
        Self::new(vec![Verdict::incomplete(vec![missing.to_string()], "not finished")])
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait::async_trait]
impl Verifier for ScriptedVerifier {
    async fn verify(&self, _messages: &[Message]) -> agentrail_core::Result<Verdict> {
        let mut calls = self.calls.lock().unwrap();
        let verdict = self.verdicts[(*calls).min(self.verdicts.len() - 1)].clone();
        *calls += 1;
        Ok(verdict)
    }
}
