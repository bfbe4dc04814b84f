//! OpenAI-compatible provider implementation.
//!
//! Works with: OpenAI, OpenRouter, Ollama, vLLM, Together AI, Fireworks AI,
//! and any endpoint exposing `/chat/completions`.
//!
//! Supports:
//! - Chat completions (non-streaming and streaming SSE)
//! - Tool use / function calling
//! - The `{"needsMoreWork": ..., "content": ...}` completion signal

use agentrail_core::error::ProviderError;
use agentrail_core::message::{Message, Role, pair_results};
use agentrail_core::provider::*;
use agentrail_core::tool::{ToolCall, ToolResult};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_RETRY_AFTER_SECS: u64 = 5;

/// An OpenAI-compatible LLM provider.
///
/// Request deadlines are owned by the agent loop, so the client only bounds
/// connection setup.
pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    /// Create a new OpenAI-compatible provider.
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_default();

        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
        }
    }

    /// Create an OpenRouter provider (convenience constructor).
    pub fn openrouter(api_key: impl Into<String>) -> Self {
        Self::new("openrouter", "https://openrouter.ai/api/v1", api_key)
    }

    /// Create an OpenAI provider (convenience constructor).
    pub fn openai(api_key: impl Into<String>) -> Self {
        Self::new("openai", "https://api.openai.com/v1", api_key)
    }

    /// Create an Ollama provider (convenience constructor).
    pub fn ollama(base_url: Option<&str>) -> Self {
        Self::new("ollama", base_url.unwrap_or("http://localhost:11434/v1"), "ollama")
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Convert conversation turns to the wire format.
    ///
    /// A tool turn carries every result of one batch; the wire wants one
    /// `tool` message per call of the preceding assistant turn.
    fn to_api_messages(messages: &[Message]) -> Vec<ApiMessage> {
        let mut out = Vec::with_capacity(messages.len());
        let mut last_calls: &[ToolCall] = &[];

        for m in messages {
            match m.role {
                Role::Tool if !last_calls.is_empty() => {
                    for (idx, (call, result)) in pair_results(last_calls, &m.tool_results).into_iter().enumerate() {
                        out.push(ApiMessage {
                            role: "tool".into(),
                            content: Some(result.map_or_else(|| "No result recorded".to_string(), render_result)),
                            tool_calls: None,
                            tool_call_id: Some(wire_call_id(call, idx)),
                        });
                    }
                    last_calls = &[];
                }
                Role::Tool => {
                    // Results without a preceding call turn cannot be sent as
                    // `tool` messages; keep their text as a user turn.
                    out.push(ApiMessage::text("user", &m.content));
                }
                Role::Assistant if m.has_tool_calls() => {
                    let calls = m
                        .tool_calls
                        .iter()
                        .enumerate()
                        .map(|(idx, tc)| ApiToolCall {
                            id: wire_call_id(tc, idx),
                            r#type: "function".into(),
                            function: ApiFunction {
                                name: tc.name.clone(),
                                arguments: encode_arguments(&tc.arguments),
                            },
                        })
                        .collect();
                    out.push(ApiMessage {
                        role: "assistant".into(),
                        content: (!m.content.is_empty()).then(|| m.content.clone()),
                        tool_calls: Some(calls),
                        tool_call_id: None,
                    });
                    last_calls = &m.tool_calls;
                }
                role => {
                    out.push(ApiMessage::text(&role.to_string(), &m.content));
                    last_calls = &[];
                }
            }
        }
        out
    }

    /// Convert tool definitions to OpenAI API format.
    fn to_api_tools(tools: &[ToolDefinition]) -> Vec<ApiToolDefinition> {
        tools
            .iter()
            .map(|t| ApiToolDefinition {
                r#type: "function".into(),
                function: ApiToolFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                },
            })
            .collect()
    }

    fn request_body(request: &ProviderRequest, stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": Self::to_api_messages(&request.messages),
            "temperature": request.temperature,
            "stream": stream,
        });
        if stream {
            body["stream_options"] = serde_json::json!({ "include_usage": true });
        }
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(Self::to_api_tools(&request.tools));
        }
        body
    }

    async fn post(&self, body: &serde_json::Value, stream: bool) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut builder = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(body);
        if stream {
            builder = builder.header("Accept", "text/event-stream");
        }
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout(e.to_string())
            } else {
                ProviderError::Network(e.to_string())
            }
        })?;
        self.check_status(response).await
    }

    async fn check_status(&self, response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
        let status = response.status().as_u16();
        match status {
            200..=299 => Ok(response),
            429 => {
                let retry_after_secs = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
                Err(ProviderError::RateLimited { retry_after_secs })
            }
            401 | 403 => Err(ProviderError::AuthenticationFailed(
                "Invalid API key or insufficient permissions".into(),
            )),
            404 => {
                let body = response.text().await.unwrap_or_default();
                Err(ProviderError::ModelNotFound(body))
            }
            _ => {
                let body = response.text().await.unwrap_or_default();
                warn!(provider = %self.name, status, body = %body, "Provider returned error");
                Err(ProviderError::ApiError {
                    status_code: status,
                    message: body,
                })
            }
        }
    }
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        debug!(provider = %self.name, model = %request.model, "Sending completion request");
        let response = self.post(&Self::request_body(&request, false), false).await?;

        let api_response: ApiResponse = response.json().await.map_err(|e| ProviderError::ApiError {
            status_code: 200,
            message: format!("Failed to parse response: {e}"),
        })?;
        response_from_api(api_response)
    }

    async fn stream(
        &self,
        request: ProviderRequest,
    ) -> Result<mpsc::Receiver<Result<StreamChunk, ProviderError>>, ProviderError> {
        debug!(provider = %self.name, model = %request.model, "Sending streaming request");
        let response = self.post(&Self::request_body(&request, true), true).await?;

        let (tx, rx) = mpsc::channel(64);
        let provider_name = self.name.clone();
        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut parser = SseParser::default();

            while let Some(chunk_result) = byte_stream.next().await {
                let bytes = match chunk_result {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx.send(Err(ProviderError::StreamInterrupted(e.to_string()))).await;
                        return;
                    }
                };
                for event in parser.feed(&String::from_utf8_lossy(&bytes)) {
                    match event {
                        SseEvent::Chunk(chunk) => {
                            let done = chunk.done;
                            if tx.send(Ok(chunk)).await.is_err() || done {
                                return;
                            }
                        }
                        SseEvent::Unparseable { data, error } => {
                            trace!(provider = %provider_name, data = %data, error = %error, "Ignoring unparseable SSE chunk");
                        }
                    }
                }
            }

            // Stream ended without [DONE]
            let _ = tx.send(Ok(parser.finish(None))).await;
        });

        Ok(rx)
    }

    async fn health_check(&self) -> Result<bool, ProviderError> {
        let url = format!("{}/models", self.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        Ok(response.status().is_success())
    }
}

fn wire_call_id(call: &ToolCall, idx: usize) -> String {
    if call.id.is_empty() {
        format!("call_{idx}")
    } else {
        call.id.clone()
    }
}

fn render_result(result: &ToolResult) -> String {
    match (&result.error, result.success) {
        (_, true) if result.content.is_empty() => "[No output]".into(),
        (_, true) => result.content.clone(),
        (Some(err), false) => format!("Error: {err}"),
        (None, false) => format!("Error: {}", result.content),
    }
}

fn encode_arguments(arguments: &serde_json::Value) -> String {
    match arguments {
        serde_json::Value::Null => "{}".into(),
        serde_json::Value::String(raw) => raw.clone(),
        other => other.to_string(),
    }
}

/// Arguments that fail to parse are kept as the raw string so the tool can
/// report them as invalid.
fn decode_arguments(raw: &str) -> serde_json::Value {
    if raw.trim().is_empty() {
        return serde_json::Value::Object(serde_json::Map::new());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

fn response_from_api(api_response: ApiResponse) -> Result<ProviderResponse, ProviderError> {
    let choice = api_response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::EmptyResponse("no choices in response".into()))?;

    let tool_calls: Vec<ToolCall> = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|tc| ToolCall {
            id: tc.id,
            name: tc.function.name,
            arguments: decode_arguments(&tc.function.arguments),
        })
        .collect();

    let raw = choice.message.content.unwrap_or_default();
    let (content, needs_more_work) = match parse_completion_signal(&raw) {
        Some((content, more)) => (content, Some(more)),
        None => (raw, None),
    };

    if content.trim().is_empty() && tool_calls.is_empty() {
        return Err(ProviderError::EmptyResponse(
            "model returned neither text nor tool calls".into(),
        ));
    }

    let usage = api_response.usage.map(Usage::from);
    Ok(ProviderResponse {
        message: Message::assistant_with_tool_calls(content, tool_calls),
        usage,
        model: api_response.model,
        needs_more_work,
    })
}

// --- SSE parsing ---

enum SseEvent {
    Chunk(StreamChunk),
    Unparseable { data: String, error: String },
}

/// Incremental parser for the `data: {...}` lines of a streaming response.
/// Tool call deltas are accumulated by index and emitted with the final chunk.
#[derive(Default)]
struct SseParser {
    buffer: String,
    tool_calls: BTreeMap<u32, ToolCallAccumulator>,
    finished: bool,
}

impl SseParser {
    fn feed(&mut self, text: &str) -> Vec<SseEvent> {
        self.buffer.push_str(text);
        let mut events = Vec::new();

        while let Some(line_end) = self.buffer.find('\n') {
            let line = self.buffer[..line_end].trim_end_matches('\r').to_string();
            self.buffer.drain(..=line_end);

            if self.finished || line.is_empty() || line.starts_with(':') {
                continue;
            }
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();

            if data == "[DONE]" {
                events.push(SseEvent::Chunk(self.finish(None)));
                continue;
            }

            match serde_json::from_str::<StreamResponse>(data) {
                Ok(resp) => {
                    if let Some(choice) = resp.choices.into_iter().next() {
                        for delta in choice.delta.tool_calls.unwrap_or_default() {
                            let acc = self.tool_calls.entry(delta.index).or_default();
                            if let Some(id) = delta.id {
                                acc.id = id;
                            }
                            if let Some(func) = delta.function {
                                if let Some(name) = func.name {
                                    acc.name = name;
                                }
                                if let Some(args) = func.arguments {
                                    acc.arguments.push_str(&args);
                                }
                            }
                        }
                        if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
                            events.push(SseEvent::Chunk(StreamChunk {
                                content: Some(content),
                                tool_calls: Vec::new(),
                                done: false,
                                usage: None,
                            }));
                        }
                    }
                    if let Some(usage) = resp.usage {
                        events.push(SseEvent::Chunk(self.finish(Some(usage.into()))));
                    }
                }
                Err(e) => events.push(SseEvent::Unparseable {
                    data: data.to_string(),
                    error: e.to_string(),
                }),
            }
        }
        events
    }

    /// The terminal chunk carrying every accumulated tool call.
    fn finish(&mut self, usage: Option<Usage>) -> StreamChunk {
        self.finished = true;
        let tool_calls = std::mem::take(&mut self.tool_calls)
            .into_values()
            .map(ToolCallAccumulator::into_tool_call)
            .collect();
        StreamChunk {
            content: None,
            tool_calls,
            done: true,
            usage,
        }
    }
}

/// Accumulates incremental tool call deltas into a complete tool call.
#[derive(Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    arguments: String,
}

impl ToolCallAccumulator {
    fn into_tool_call(self) -> ToolCall {
        ToolCall {
            id: self.id,
            name: self.name,
            arguments: decode_arguments(&self.arguments),
        }
    }
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl ApiMessage {
    fn text(role: &str, content: &str) -> Self {
        Self {
            role: role.into(),
            content: Some(content.to_string()),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolCall {
    #[serde(default)]
    id: String,
    #[serde(default = "function_type")]
    r#type: String,
    function: ApiFunction,
}

fn function_type() -> String {
    "function".into()
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Serialize)]
struct ApiToolDefinition {
    r#type: String,
    function: ApiToolFunction,
}

#[derive(Debug, Serialize)]
struct ApiToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    model: String,
    #[serde(default)]
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

impl From<ApiUsage> for Usage {
    fn from(u: ApiUsage) -> Self {
        Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

/// A tool call delta; arrives incrementally across chunks.
#[derive(Debug, Deserialize)]
struct StreamToolCallDelta {
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chunks(events: Vec<SseEvent>) -> Vec<StreamChunk> {
        events
            .into_iter()
            .filter_map(|e| match e {
                SseEvent::Chunk(c) => Some(c),
                SseEvent::Unparseable { .. } => None,
            })
            .collect()
    }

    #[test]
    fn constructors_set_base_url() {
        let provider = OpenAiCompatProvider::openrouter("sk-test");
        assert_eq!(provider.name(), "openrouter");
        assert!(provider.base_url().contains("openrouter.ai"));

        let local = OpenAiCompatProvider::ollama(Some("http://127.0.0.1:11434/v1/"));
        assert_eq!(local.base_url(), "http://127.0.0.1:11434/v1");
    }

    #[test]
    fn tool_turn_expands_to_one_wire_message_per_call() {
        let calls = vec![
            ToolCall {
                id: "call_a".into(),
                name: "file_read".into(),
                arguments: json!({"path": "README.md"}),
            },
            ToolCall {
                id: "call_b".into(),
                name: "shell".into(),
                arguments: json!({"command": "ls"}),
            },
        ];
        let results = vec![
            ToolResult::failure("call_b", "permission denied"),
            ToolResult::success("call_a", "# Title"),
        ];
        let messages = vec![
            Message::system("You are helpful"),
            Message::user("Summarize the repo"),
            Message::assistant_with_tool_calls("", calls),
            Message::tool_results("summary", results),
        ];

        let api = OpenAiCompatProvider::to_api_messages(&messages);
        assert_eq!(api.len(), 5);
        assert_eq!(api[2].role, "assistant");
        assert!(api[2].content.is_none());
        let wire_calls = api[2].tool_calls.as_ref().unwrap();
        assert_eq!(wire_calls[0].function.arguments, r#"{"path":"README.md"}"#);

        assert_eq!(api[3].tool_call_id.as_deref(), Some("call_a"));
        assert_eq!(api[3].content.as_deref(), Some("# Title"));
        assert_eq!(api[4].tool_call_id.as_deref(), Some("call_b"));
        assert_eq!(api[4].content.as_deref(), Some("Error: permission denied"));
    }

    #[test]
    fn missing_ids_are_matched_by_position() {
        let calls = vec![ToolCall {
            id: String::new(),
            name: "shell".into(),
            arguments: serde_json::Value::Null,
        }];
        let messages = vec![
            Message::assistant_with_tool_calls("checking", calls),
            Message::tool_results("", vec![ToolResult::success("", "")]),
        ];

        let api = OpenAiCompatProvider::to_api_messages(&messages);
        let wire_calls = api[0].tool_calls.as_ref().unwrap();
        assert_eq!(wire_calls[0].id, "call_0");
        assert_eq!(wire_calls[0].function.arguments, "{}");
        assert_eq!(api[1].tool_call_id.as_deref(), Some("call_0"));
        assert_eq!(api[1].content.as_deref(), Some("[No output]"));
    }

    #[test]
    fn orphan_tool_turn_becomes_user_text() {
        let messages = vec![Message::tool_results("[shell] ok", vec![])];
        let api = OpenAiCompatProvider::to_api_messages(&messages);
        assert_eq!(api[0].role, "user");
        assert_eq!(api[0].content.as_deref(), Some("[shell] ok"));
    }

    #[test]
    fn request_body_includes_tools_and_limits() {
        let mut request = ProviderRequest::new("gpt-4o", vec![Message::user("hi")]);
        request.max_tokens = Some(256);
        request.tools = vec![ToolDefinition {
            name: "shell".into(),
            description: "Run a shell command".into(),
            parameters: json!({"type": "object"}),
        }];

        let body = OpenAiCompatProvider::request_body(&request, true);
        assert_eq!(body["max_tokens"], 256);
        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["tools"][0]["function"]["name"], "shell");
        assert_eq!(body["stream_options"]["include_usage"], true);

        let plain = OpenAiCompatProvider::request_body(&ProviderRequest::new("gpt-4o", vec![]), false);
        assert!(plain.get("tools").is_none());
        assert!(plain.get("stream_options").is_none());
    }

    #[test]
    fn completion_response_decodes_tool_calls() {
        let api: ApiResponse = serde_json::from_value(json!({
            "model": "gpt-4o",
            "choices": [{"message": {"role": "assistant", "content": null, "tool_calls": [
                {"id": "call_1", "type": "function", "function": {"name": "shell", "arguments": "{\"command\":\"ls\"}"}}
            ]}}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        }))
        .unwrap();

        let response = response_from_api(api).unwrap();
        assert_eq!(response.message.tool_calls.len(), 1);
        assert_eq!(response.message.tool_calls[0].arguments, json!({"command": "ls"}));
        assert_eq!(response.usage.unwrap().total_tokens, 15);
        assert!(response.needs_more_work.is_none());
    }

    #[test]
    fn completion_signal_sets_needs_more_work() {
        let api: ApiResponse = serde_json::from_value(json!({
            "model": "gpt-4o",
            "choices": [{"message": {"role": "assistant",
                "content": "{\"needsMoreWork\": false, \"content\": \"Renamed 3 files.\"}"}}]
        }))
        .unwrap();

        let response = response_from_api(api).unwrap();
        assert_eq!(response.message.content, "Renamed 3 files.");
        assert_eq!(response.needs_more_work, Some(false));
    }

    #[test]
    fn empty_completion_is_an_empty_response_error() {
        let api: ApiResponse = serde_json::from_value(json!({
            "model": "gpt-4o",
            "choices": [{"message": {"role": "assistant", "content": "   "}}]
        }))
        .unwrap();
        assert!(response_from_api(api).unwrap_err().is_empty_response());

        let none: ApiResponse = serde_json::from_value(json!({"model": "gpt-4o", "choices": []})).unwrap();
        assert!(response_from_api(none).unwrap_err().is_empty_response());
    }

    #[test]
    fn malformed_arguments_are_kept_raw() {
        assert_eq!(decode_arguments("{\"a\": 1"), json!("{\"a\": 1"));
        assert_eq!(decode_arguments(""), json!({}));
    }

    #[test]
    fn sse_content_and_tool_call_deltas() {
        let mut parser = SseParser::default();
        let first = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n",
            ": keep-alive\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_1\",\"function\":{\"name\":\"shell\",\"arguments\":\"{\\\"comm\"}}]}}]}\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n",
        );
        let out = chunks(parser.feed(first));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].content.as_deref(), Some("Hel"));
        assert_eq!(out[1].content.as_deref(), Some("lo"));

        // A line split across network reads.
        let out = chunks(parser.feed("data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"and\\\":\\\"ls\\\"}\"}}]}}]}\ndata: [DO"));
        assert!(out.is_empty());
        let out = chunks(parser.feed("NE]\n"));
        assert_eq!(out.len(), 1);
        assert!(out[0].done);
        assert_eq!(out[0].tool_calls[0].id, "call_1");
        assert_eq!(out[0].tool_calls[0].arguments, json!({"command": "ls"}));
    }

    #[test]
    fn sse_usage_chunk_finishes_the_stream() {
        let mut parser = SseParser::default();
        let out = chunks(parser.feed(concat!(
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":10,\"completion_tokens\":5,\"total_tokens\":15}}\n",
            "data: [DONE]\n",
        )));
        assert_eq!(out.len(), 1);
        assert!(out[0].done);
        assert_eq!(out[0].usage.as_ref().unwrap().total_tokens, 15);
    }

    #[test]
    fn sse_garbage_is_reported_not_fatal() {
        let mut parser = SseParser::default();
        let events = parser.feed("data: {oops\ndata: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n");
        assert!(matches!(events[0], SseEvent::Unparseable { .. }));
        assert_eq!(chunks(events)[0].content.as_deref(), Some("ok"));
    }
}
