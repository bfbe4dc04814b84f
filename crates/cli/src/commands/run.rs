//! `agentrail run`: run one task in-process and render its progress.

use agentrail_agent::TerminalState;
use agentrail_config::AppConfig;
use agentrail_core::{ConversationId, ProgressEvent, StepStatus};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

pub async fn run(message: String, conversation: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;

    if !config.has_api_key() && config.providers.values().all(|p| p.api_key.is_none()) {
        eprintln!("⚠️  No API key configured.");
        eprintln!("   Set OPENROUTER_API_KEY (or OPENAI_API_KEY), or add api_key to:");
        eprintln!("   {}", AppConfig::config_dir().join("config.toml").display());
        eprintln!("   Run `agentrail init` to create a default config.");
        return Err("missing API key".into());
    }

    let runtime = agentrail_gateway::build_runtime(config)?;

    let mut request = runtime.new_request(message);
    if let Some(id) = conversation {
        let id = ConversationId::from(&id);
        let history = runtime.load_history(&id).await;
        request = request.with_conversation(id, history);
    }
    let session_id = request.session_id.clone();

    let renderer = tokio::spawn(render_progress(runtime.subscribe(), session_id.clone()));
    let mut handle = runtime.spawn(request);

    let result = tokio::select! {
        r = &mut handle => r,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("\n⛔ Stopping...");
            let report = runtime.stop_all();
            eprintln!(
                "   {} session(s), {} process(es) terminated",
                report.sessions.len(),
                report.processes_terminated
            );
            handle.await
        }
    };
    renderer.abort();

    let outcome = result.map_err(|e| format!("agent task failed: {e}"))??;
    println!("{}", outcome.final_content);
    eprintln!(
        "\n[{}] {} iteration(s), conversation {}",
        outcome.status, outcome.iterations, outcome.conversation_id
    );

    // Tool children must not outlive the CLI.
    runtime.processes().terminate_all();

    if outcome.status != TerminalState::Completed {
        return Err(format!("run ended {}", outcome.status).into());
    }
    Ok(())
}

async fn render_progress(mut rx: broadcast::Receiver<Arc<ProgressEvent>>, session_id: String) {
    let mut view = StepView::default();
    loop {
        match rx.recv().await {
            Ok(event) if event.session_id == session_id => {
                for line in view.update(&event) {
                    eprintln!("{line}");
                }
                if event.is_complete {
                    break;
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::debug!(skipped = n, "Progress renderer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Turns successive snapshots into terminal lines, printing each step once
/// per status it passes through.
#[derive(Default)]
pub struct StepView {
    seen: HashMap<String, StepStatus>,
    last_retry: Option<(String, u32)>,
    last_approval: Option<String>,
}

impl StepView {
    pub fn update(&mut self, event: &ProgressEvent) -> Vec<String> {
        let mut lines = Vec::new();

        for step in &event.steps {
            if self.seen.get(&step.id) == Some(&step.status) {
                continue;
            }
            self.seen.insert(step.id.clone(), step.status);

            let mut line = format!(
                "{} [{}/{}] {}",
                marker(step.status),
                event.current_iteration,
                event.max_iterations,
                step.title
            );
            if let Some(result) = &step.tool_result
                && !result.success
                && let Some(err) = &result.error
            {
                line.push_str(&format!(": {}", first_line(err)));
            }
            lines.push(line);
        }

        if let Some(retry) = &event.retry_info {
            let key = (retry.tool_name.clone(), retry.attempt);
            if self.last_retry.as_ref() != Some(&key) {
                lines.push(format!(
                    "↻ retrying {} ({}/{}) in {}ms: {}",
                    retry.tool_name,
                    retry.attempt,
                    retry.max_retries,
                    retry.delay_ms,
                    first_line(&retry.reason)
                ));
                self.last_retry = Some(key);
            }
        }

        if let Some(approval) = &event.pending_approval
            && self.last_approval.as_deref() != Some(approval.approval_id.as_str())
        {
            lines.push(format!(
                "? approval needed for {} (id {})",
                approval.tool_name, approval.approval_id
            ));
            self.last_approval = Some(approval.approval_id.clone());
        }

        lines
    }
}

fn marker(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Pending => "·",
        StepStatus::InProgress => "…",
        StepStatus::Completed => "✓",
        StepStatus::Error => "✗",
        StepStatus::AwaitingApproval => "?",
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}
