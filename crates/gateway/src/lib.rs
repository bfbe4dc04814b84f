//! HTTP API gateway for AgentRail.
//!
//! Exposes the health check and the v1 control surface: chat (JSON or SSE
//! progress stream), per-session and global stop, session status, and
//! approval answers.
//!
//! Built on Axum.

pub mod api_v1;

use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderValue, Method, header};
use axum::{Router, extract::State, response::Json, routing::get};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use agentrail_agent::AgentRuntime;
use agentrail_config::AppConfig;
use agentrail_core::ProcessTracker;

/// Build the full router: `/health` plus the v1 API under `/v1`.
///
/// Layers applied:
/// - CORS restricted to the local desktop client origins
/// - Request body size limit (1 MB)
/// - HTTP trace logging
pub fn build_router(runtime: Arc<AgentRuntime>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list([
            HeaderValue::from_static("http://localhost:8080"),
            HeaderValue::from_static("http://127.0.0.1:8080"),
            HeaderValue::from_static("tauri://localhost"),
        ]))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .max_age(std::time::Duration::from_secs(3600));

    Router::new()
        .route("/health", get(health_handler))
        .with_state(runtime.clone())
        .nest("/v1", api_v1::v1_router(runtime))
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Build the runtime from configuration: provider, tools, store.
pub fn build_runtime(config: AppConfig) -> Result<Arc<AgentRuntime>, Box<dyn std::error::Error>> {
    let router = agentrail_providers::build_from_config(&config);
    let provider = router
        .default()
        .ok_or_else(|| format!("no provider registered as '{}'", config.default_provider))?;
    if config.api_key.is_none() && config.providers.values().all(|p| p.api_key.is_none()) {
        warn!("No API key configured; requests to hosted providers will fail");
    }

    let processes = ProcessTracker::new();
    let tools = Arc::new(agentrail_tools::default_registry(&config.tools, processes.clone()));
    let store = agentrail_store::from_config(&config);
    Ok(Arc::new(AgentRuntime::new(config, provider, tools, processes, store)))
}

/// Start the gateway HTTP server.
///
/// Ctrl-C stops every running session before the server exits.
pub async fn start(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let runtime = build_runtime(config)?;
    let app = build_router(runtime.clone());

    info!(addr = %addr, "Gateway starting");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            let report = runtime.stop_all();
            info!(sessions = report.sessions.len(), "Shutting down gateway");
        })
        .await?;

    Ok(())
}

// --- Handlers ---

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    active_sessions: usize,
}

async fn health_handler(State(runtime): State<Arc<AgentRuntime>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        active_sessions: runtime.active_sessions().len(),
    })
}
