//! End-to-end tests: a scripted model driving the real built-in tools
//! through the full runtime (loop, executor, gate, broadcaster, store).

use agentrail_agent::{AgentRuntime, TerminalState};
use agentrail_config::AppConfig;
use agentrail_core::error::ProviderError;
use agentrail_core::{
    Message, ProcessTracker, Provider, ProviderRequest, ProviderResponse, Role, StepType, ToolCall,
};
use agentrail_store::InMemoryStore;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Replays a fixed list of responses; the last one repeats.
struct ScriptedProvider {
    script: Mutex<VecDeque<ProviderResponse>>,
    requests: Mutex<Vec<ProviderRequest>>,
    delay: Option<Duration>,
}

impl ScriptedProvider {
    fn new(script: Vec<ProviderResponse>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    fn slow(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.requests.lock().unwrap().push(request);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let mut script = self.script.lock().unwrap();
        let next = if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().cloned()
        };
        next.ok_or_else(|| ProviderError::EmptyResponse("script exhausted".into()))
    }
}

fn text(content: &str) -> ProviderResponse {
    ProviderResponse {
        message: Message::assistant(content),
        usage: None,
        model: "scripted-model".into(),
        needs_more_work: None,
    }
}

fn call(name: &str, arguments: serde_json::Value) -> ProviderResponse {
    ProviderResponse {
        message: Message::assistant_with_tool_calls(
            "",
            vec![ToolCall {
                id: format!("call_{name}"),
                name: name.into(),
                arguments,
            }],
        ),
        usage: None,
        model: "scripted-model".into(),
        needs_more_work: None,
    }
}

fn runtime_in(workspace: &std::path::Path, provider: Arc<ScriptedProvider>) -> (Arc<AgentRuntime>, ProcessTracker) {
    runtime_with(AppConfig::default(), workspace, provider)
}

fn runtime_with(
    mut config: AppConfig,
    workspace: &std::path::Path,
    provider: Arc<ScriptedProvider>,
) -> (Arc<AgentRuntime>, ProcessTracker) {
    config.agent.verify_completion = false;
    config.tools.workspace_root = Some(workspace.to_path_buf());
    let processes = ProcessTracker::new();
    let tools = Arc::new(agentrail_tools::default_registry(&config.tools, processes.clone()));
    let runtime = Arc::new(AgentRuntime::new(
        config,
        provider,
        tools,
        processes.clone(),
        Arc::new(InMemoryStore::new()),
    ));
    (runtime, processes)
}

const SUMMARY: &str = "I wrote notes.txt with the release checklist and confirmed its contents.";

#[tokio::test]
async fn file_tools_then_answer() {
    let workspace = tempfile::tempdir().unwrap();
    let provider = Arc::new(ScriptedProvider::new(vec![
        call("file_write", serde_json::json!({"path": "notes.txt", "content": "1. tag\n2. publish"})),
        call("file_read", serde_json::json!({"path": "notes.txt"})),
        text(SUMMARY),
    ]));
    let (runtime, _) = runtime_in(workspace.path(), provider.clone());

    let outcome = runtime.run(runtime.new_request("write the release checklist")).await.unwrap();
    assert_eq!(outcome.status, TerminalState::Completed);
    assert_eq!(outcome.final_content, SUMMARY);
    assert_eq!(outcome.iterations, 3);

    let written = std::fs::read_to_string(workspace.path().join("notes.txt")).unwrap();
    assert_eq!(written, "1. tag\n2. publish");

    // The third model call sees the read result.
    let requests = provider.requests();
    assert_eq!(requests.len(), 3);
    let tool_turns: Vec<_> = requests[2].messages.iter().filter(|m| m.role == Role::Tool).collect();
    assert_eq!(tool_turns.len(), 2);
    let read = &tool_turns[1].tool_results[0];
    assert!(read.success);
    assert!(read.content.contains("2. publish"));
}

#[tokio::test]
async fn blocked_command_is_reported_to_the_model() {
    let workspace = tempfile::tempdir().unwrap();
    let provider = Arc::new(ScriptedProvider::new(vec![
        call("shell", serde_json::json!({"command": "rm -rf /"})),
        text("I cannot delete files here; the command is not on the allowlist."),
    ]));
    let (runtime, _) = runtime_in(workspace.path(), provider.clone());

    let outcome = runtime.run(runtime.new_request("clean everything")).await.unwrap();
    assert_eq!(outcome.status, TerminalState::Completed);

    let requests = provider.requests();
    let tool_turn = requests[1].messages.iter().find(|m| m.role == Role::Tool).unwrap();
    let result = &tool_turn.tool_results[0];
    assert!(!result.success);
    assert!(result.error.as_deref().unwrap_or_default().contains("Permission denied"));
}

#[tokio::test]
async fn progress_stream_ends_with_one_terminal_event() {
    let workspace = tempfile::tempdir().unwrap();
    let provider = Arc::new(ScriptedProvider::new(vec![
        call("file_write", serde_json::json!({"path": "notes.txt", "content": "draft"})),
        text(SUMMARY),
    ]));
    let (runtime, _) = runtime_in(workspace.path(), provider);
    let mut events = runtime.subscribe();

    let request = runtime.new_request("write the release checklist");
    let session_id = request.session_id.clone();
    let outcome = runtime.spawn(request).await.unwrap().unwrap();
    assert_eq!(outcome.status, TerminalState::Completed);

    let received: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
        .filter(|e| e.session_id == session_id)
        .collect();
    assert!(!received.is_empty());

    let terminal: Vec<_> = received.iter().filter(|e| e.is_complete).collect();
    assert_eq!(terminal.len(), 1);
    assert!(received.last().unwrap().is_complete);
    assert_eq!(terminal[0].final_content.as_deref(), Some(SUMMARY));
    assert!(
        terminal[0]
            .steps
            .iter()
            .any(|s| s.step_type == StepType::Completion)
    );
}

#[tokio::test]
async fn conversation_is_persisted_across_runs() {
    let workspace = tempfile::tempdir().unwrap();
    let provider = Arc::new(ScriptedProvider::new(vec![text(SUMMARY)]));
    let (runtime, _) = runtime_in(workspace.path(), provider.clone());

    let first = runtime.run(runtime.new_request("first task")).await.unwrap();
    let history = runtime.load_history(&first.conversation_id).await;
    let follow_up = runtime
        .new_request("and now the follow-up")
        .with_conversation(first.conversation_id.clone(), history);
    let second = runtime.run(follow_up).await.unwrap();
    assert_eq!(second.conversation_id, first.conversation_id);

    let stored = runtime.load_history(&first.conversation_id).await;
    assert_eq!(stored.len(), 4);
    assert!(stored.iter().all(|m| m.role != Role::System));

    // The second call carried the first exchange.
    let requests = provider.requests();
    assert!(requests[1].messages.iter().any(|m| m.content == "first task"));
}

#[cfg(unix)]
#[tokio::test]
async fn emergency_stop_aborts_run_and_kills_child() {
    let workspace = tempfile::tempdir().unwrap();
    let provider = Arc::new(ScriptedProvider::new(vec![
        call("shell", serde_json::json!({"command": "sleep 30"})),
        text(SUMMARY),
    ]));
    let mut config = AppConfig::default();
    config.tools.allowed_commands.clear();
    let (runtime, processes) = runtime_with(config, workspace.path(), provider);

    let handle = runtime.spawn(runtime.new_request("wait for the build"));
    while processes.live() == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let report = runtime.stop_all();
    assert_eq!(report.sessions.len(), 1);
    assert_eq!(report.processes_terminated, 1);

    let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(outcome.status, TerminalState::Aborted);
    assert!(runtime.active_sessions().is_empty());
}

#[tokio::test]
async fn stopping_during_model_call_aborts() {
    let workspace = tempfile::tempdir().unwrap();
    let provider = Arc::new(ScriptedProvider::new(vec![text(SUMMARY)]).slow(Duration::from_secs(30)));
    let (runtime, _) = runtime_in(workspace.path(), provider);

    let request = runtime.new_request("think for a long time");
    let session_id = request.session_id.clone();
    let handle = runtime.spawn(request);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(runtime.stop_session(&session_id));
    let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(outcome.status, TerminalState::Aborted);
}
