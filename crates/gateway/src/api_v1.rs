//! HTTP API v1: chat, cancellation and approvals.
//!
//! Endpoints:
//!
//! - `POST /v1/chat`: Run the agent; JSON result or SSE progress stream
//! - `POST /v1/emergency-stop`: Stop every session and kill tool processes
//! - `POST /v1/sessions/{id}/stop`: Stop one session
//! - `GET  /v1/sessions/{id}`: Whether a session is live / stopped
//! - `POST /v1/approvals/{id}`: Answer a pending tool approval

use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use agentrail_agent::{AgentRuntime, RunOutcome, RunRequest, SessionStatus};
use agentrail_core::{ConversationId, ProgressEvent};

pub type SharedApiState = Arc<AgentRuntime>;

// ── Router ────────────────────────────────────────────────────────────────

/// Build the v1 API router. Nest this under "/v1" in the main router.
pub fn v1_router(state: SharedApiState) -> Router {
    Router::new()
        .route("/chat", post(chat_handler))
        .route("/emergency-stop", post(emergency_stop_handler))
        .route("/sessions/{id}", get(session_handler))
        .route("/sessions/{id}/stop", post(stop_session_handler))
        .route("/approvals/{id}", post(approval_handler))
        .with_state(state)
}

// ── DTOs ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatResponse {
    pub session_id: String,
    pub conversation_id: String,
    pub content: String,
    pub status: String,
    pub iterations: u32,
}

impl From<RunOutcome> for ChatResponse {
    fn from(outcome: RunOutcome) -> Self {
        Self {
            session_id: outcome.session_id,
            conversation_id: outcome.conversation_id.to_string(),
            content: outcome.final_content,
            status: outcome.status.to_string(),
            iterations: outcome.iterations,
        }
    }
}

/// One SSE frame: `{"type": "progress" | "done" | "error", "data": ...}`.
#[derive(Debug, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
enum StreamEnvelope {
    Progress(ProgressEvent),
    Done(ChatResponse),
    Error { message: String },
}

impl StreamEnvelope {
    fn kind(&self) -> &'static str {
        match self {
            StreamEnvelope::Progress(_) => "progress",
            StreamEnvelope::Done(_) => "done",
            StreamEnvelope::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Serialize)]
struct ControlResponse {
    success: bool,
    message: String,
}

#[derive(Debug, Serialize)]
struct EmergencyStopResponse {
    success: bool,
    message: String,
    sessions: Vec<String>,
    approvals_cancelled: usize,
    processes_terminated: usize,
}

#[derive(Debug, Serialize)]
struct SessionResponse {
    session_id: String,
    active: bool,
    stopped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<SessionStatus>,
}

#[derive(Debug, Deserialize)]
struct ApprovalRequest {
    approved: bool,
}

#[derive(Debug, Serialize)]
struct ApprovalResponse {
    success: bool,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ErrorResponse { error: message.into() })).into_response()
}

// ── Handlers ──────────────────────────────────────────────────────────────

async fn chat_handler(State(state): State<SharedApiState>, Json(payload): Json<ChatRequest>) -> Response {
    if payload.message.trim().is_empty() {
        return error(StatusCode::BAD_REQUEST, "message must not be empty");
    }

    let request = build_request(&state, &payload).await;
    let session_id = request.session_id.clone();
    info!(
        session_id = %session_id,
        stream = payload.stream,
        history = request.history.len(),
        "v1/chat request"
    );

    // Subscribe before the run starts so its first events are not missed.
    let events = payload.stream.then(|| state.subscribe());
    let Some(run) = state.try_spawn(request) else {
        return error(StatusCode::CONFLICT, format!("session '{session_id}' is already running"));
    };

    if let Some(events) = events {
        return stream_run(state, session_id, events, run).into_response();
    }

    match run.await {
        Ok(Ok(outcome)) => Json(ChatResponse::from(outcome)).into_response(),
        Ok(Err(e)) => {
            warn!(error = %e, "Agent run failed");
            error(StatusCode::INTERNAL_SERVER_ERROR, format!("Agent error: {e}"))
        }
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, format!("Agent task failed: {e}")),
    }
}

async fn build_request(state: &AgentRuntime, payload: &ChatRequest) -> RunRequest {
    let mut request = state.new_request(payload.message.clone());
    if let Some(id) = &payload.session_id {
        request.session_id = id.clone();
    }
    if let Some(id) = &payload.conversation_id {
        let id = ConversationId::from(id);
        let history = state.load_history(&id).await;
        request = request.with_conversation(id, history);
    }
    request
}

/// Forward a running session's progress as SSE frames.
///
/// The terminal progress event precedes the `done` frame. A client that
/// goes away stops its session.
fn stream_run(
    state: SharedApiState,
    session_id: String,
    mut events: broadcast::Receiver<Arc<ProgressEvent>>,
    mut run: JoinHandle<agentrail_core::Result<RunOutcome>>,
) -> Sse<impl futures::Stream<Item = Result<SseEvent, Infallible>>> {
    let (tx, rx) = mpsc::channel::<StreamEnvelope>(64);

    tokio::spawn(async move {
        let mut bus_open = true;
        loop {
            tokio::select! {
                biased;
                event = events.recv(), if bus_open => match event {
                    Ok(event) if event.session_id == session_id => {
                        if tx.send(StreamEnvelope::Progress((*event).clone())).await.is_err() {
                            info!(session_id = %session_id, "Stream client disconnected, stopping session");
                            state.stop_session(&session_id);
                            bus_open = false;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(session_id = %session_id, skipped, "Progress stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => bus_open = false,
                },
                result = &mut run => {
                    while let Ok(event) = events.try_recv() {
                        if event.session_id == session_id {
                            let _ = tx.send(StreamEnvelope::Progress((*event).clone())).await;
                        }
                    }
                    let last = match result {
                        Ok(Ok(outcome)) => StreamEnvelope::Done(outcome.into()),
                        Ok(Err(e)) => StreamEnvelope::Error { message: e.to_string() },
                        Err(e) => StreamEnvelope::Error { message: format!("Agent task failed: {e}") },
                    };
                    let _ = tx.send(last).await;
                    return;
                }
            }
        }
    });

    let stream = ReceiverStream::new(rx).map(|envelope| {
        let data = serde_json::to_string(&envelope).unwrap_or_default();
        Ok(SseEvent::default().event(envelope.kind()).data(data))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn emergency_stop_handler(State(state): State<SharedApiState>) -> Json<EmergencyStopResponse> {
    let report = state.stop_all();
    let message = format!(
        "Stopped {} session(s), cancelled {} approval(s), terminated {} process(es)",
        report.sessions.len(),
        report.approvals_cancelled,
        report.processes_terminated
    );
    Json(EmergencyStopResponse {
        success: true,
        message,
        sessions: report.sessions,
        approvals_cancelled: report.approvals_cancelled,
        processes_terminated: report.processes_terminated,
    })
}

async fn stop_session_handler(
    State(state): State<SharedApiState>,
    Path(id): Path<String>,
) -> (StatusCode, Json<ControlResponse>) {
    if state.stop_session(&id) {
        (
            StatusCode::OK,
            Json(ControlResponse {
                success: true,
                message: format!("Session '{id}' is stopping"),
            }),
        )
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(ControlResponse {
                success: false,
                message: format!("No active session '{id}'"),
            }),
        )
    }
}

async fn session_handler(State(state): State<SharedApiState>, Path(id): Path<String>) -> Json<SessionResponse> {
    let status = state.session_status(&id);
    Json(SessionResponse {
        active: status.is_some(),
        stopped: state.is_stopped(&id),
        session_id: id,
        status,
    })
}

async fn approval_handler(
    State(state): State<SharedApiState>,
    Path(id): Path<String>,
    Json(payload): Json<ApprovalRequest>,
) -> (StatusCode, Json<ApprovalResponse>) {
    let success = state.respond_approval(&id, payload.approved);
    let status = if success { StatusCode::OK } else { StatusCode::NOT_FOUND };
    (status, Json(ApprovalResponse { success }))
}
