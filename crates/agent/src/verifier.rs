//! Model-backed verifier: asks a model whether the conversation satisfied the
//! original request and parses a structured verdict out of its reply.

use agentrail_core::error::Error;
use agentrail_core::{Message, Provider, ProviderRequest, Role, Verdict, Verifier};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

const VERIFIER_PROMPT: &str = "You review an agent's work. Decide whether the agent fully completed the \
user's original request. Reply with only a JSON object of the form \
{\"isComplete\": true|false, \"missingItems\": [\"...\"], \"reason\": \"...\", \"confidence\": 0.0-1.0}. \
List concrete missing items when the work is incomplete.";

/// Transcript characters sent to the verifier; older text is cut first.
const MAX_TRANSCRIPT_CHARS: usize = 24_000;

pub struct ModelVerifier {
    provider: Arc<dyn Provider>,
    model: String,
}

impl ModelVerifier {
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }
}

#[async_trait]
impl Verifier for ModelVerifier {
    async fn verify(&self, messages: &[Message]) -> agentrail_core::Result<Verdict> {
        let mut request = ProviderRequest::new(
            self.model.clone(),
            vec![Message::system(VERIFIER_PROMPT), Message::user(render_transcript(messages))],
        );
        request.temperature = 0.0;

        let response = self.provider.complete(request).await?;
        let verdict = parse_verdict(&response.message.content)?;
        debug!(
            complete = verdict.is_complete,
            missing = verdict.missing_items.len(),
            "Verifier verdict"
        );
        Ok(verdict)
    }
}

/// Flatten the conversation into plain text for review.
pub fn render_transcript(messages: &[Message]) -> String {
    let mut out = String::new();
    if let Some(request) = messages.iter().find(|m| m.role == Role::User) {
        out.push_str("ORIGINAL REQUEST:\n");
        out.push_str(&request.content);
        out.push_str("\n\nCONVERSATION:\n");
    }

    let mut body = String::new();
    for message in messages.iter().filter(|m| m.role != Role::System) {
        body.push_str(&format!("{}: {}\n", message.role.to_string().to_uppercase(), message.content));
        for call in &message.tool_calls {
            body.push_str(&format!("  -> {}({})\n", call.name, call.arguments));
        }
    }

    let skip = body.chars().count().saturating_sub(MAX_TRANSCRIPT_CHARS);
    if skip > 0 {
        out.push_str("[... earlier conversation omitted]\n");
        out.extend(body.chars().skip(skip));
    } else {
        out.push_str(&body);
    }
    out
}

/// Parse a verdict from a reply that may wrap the JSON object in prose or a
/// code fence.
pub fn parse_verdict(text: &str) -> agentrail_core::Result<Verdict> {
    let start = text.find('{');
    let end = text.rfind('}');
    match (start, end) {
        (Some(start), Some(end)) if start < end => serde_json::from_str(&text[start..=end])
            .map_err(|e| Error::Verification(format!("malformed verdict: {e}"))),
        _ => Err(Error::Verification(format!(
            "no verdict object in verifier reply: {}",
            text.chars().take(200).collect::<String>()
        ))),
    }
}
