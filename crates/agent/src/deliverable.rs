//! Deliverable classification for tool-free model answers.
//!
//! Models often answer with a status update ("Let me check the logs now")
//! instead of a result, or with a placeholder. These heuristics are
//! English-specific and tunable through [`DeliverableConfig`].

use agentrail_config::DeliverableConfig;
use regex_lite::Regex;
use std::sync::LazyLock;

/// Intent phrases at the start of an answer that announce work instead of reporting it.
static STATUS_OPENER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*(let me|let's|i'll|i will|i'm going to|i am going to|i'm now|i am now|now i'll|now i will|next,? i'll|first,? i'll|first,? let me|i need to|i should|working on|checking|looking into|one moment|hold on|please wait|stand by)\b",
    )
    .expect("status opener regex")
});

/// Intent phrases anywhere in a short answer.
static STATUS_ANYWHERE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(let me (check|look|see|try|run|verify|search|find|read|open|start|investigate|examine)|i'll (now|start|begin|check|look|run|try|go ahead)|i'm going to|in progress|working on it)\b",
    )
    .expect("status anywhere regex")
});

/// Answers that stand in for content without being content.
static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(\.{3,}|…|tbd|todo|placeholder|\[no output\]|\(no content\)|\(empty\)|null|undefined|<[a-z_ ]+>)\s*$")
        .expect("placeholder regex")
});

/// What a candidate answer reads as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateClass {
    /// A real result the user can use.
    Deliverable,
    Empty,
    Placeholder,
    /// Announces work still to be done.
    StatusUpdate,
}

impl CandidateClass {
    pub fn is_deliverable(self) -> bool {
        self == CandidateClass::Deliverable
    }
}

/// Thresholds and extra phrases for [`classify_candidate`].
#[derive(Debug, Clone)]
pub struct DeliverableHeuristics {
    min_length: usize,
    max_status_length: usize,
    status_prefixes: Vec<String>,
    extra_status_phrases: Vec<String>,
    extra_placeholders: Vec<String>,
}

impl DeliverableHeuristics {
    pub fn from_config(config: &DeliverableConfig) -> Self {
        Self {
            min_length: config.min_length,
            max_status_length: config.max_status_length,
            status_prefixes: config
                .status_prefixes
                .iter()
                .map(|p| p.trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
            extra_status_phrases: config
                .extra_status_phrases
                .iter()
                .map(|p| p.to_lowercase())
                .collect(),
            extra_placeholders: config
                .extra_placeholders
                .iter()
                .map(|p| p.trim().to_lowercase())
                .collect(),
        }
    }

    pub fn classify(&self, text: &str) -> CandidateClass {
        classify_candidate(text, self)
    }
}

impl Default for DeliverableHeuristics {
    fn default() -> Self {
        Self::from_config(&DeliverableConfig::default())
    }
}

/// Classify a candidate final answer.
///
/// Long answers are deliverable even when they contain intent phrases; the
/// status-update patterns only apply below `max_status_length` characters.
pub fn classify_candidate(text: &str, heuristics: &DeliverableHeuristics) -> CandidateClass {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return CandidateClass::Empty;
    }

    let lower = trimmed.to_lowercase();
    if PLACEHOLDER_RE.is_match(trimmed)
        || heuristics.extra_placeholders.iter().any(|p| *p == lower)
        || trimmed.chars().all(|c| c.is_ascii_punctuation() || c.is_whitespace())
        || trimmed.chars().count() < heuristics.min_length
    {
        return CandidateClass::Placeholder;
    }

    if trimmed.chars().count() >= heuristics.max_status_length {
        return CandidateClass::Deliverable;
    }

    if STATUS_OPENER_RE.is_match(trimmed)
        || STATUS_ANYWHERE_RE.is_match(trimmed)
        || heuristics.status_prefixes.iter().any(|p| lower.starts_with(p.as_str()))
        || heuristics.extra_status_phrases.iter().any(|p| lower.contains(p.as_str()))
        || ends_with_lead_in(trimmed)
    {
        return CandidateClass::StatusUpdate;
    }

    CandidateClass::Deliverable
}

/// A short answer ending in ':' introduces content that never arrived.
fn ends_with_lead_in(text: &str) -> bool {
    text.ends_with(':') && !text.contains('\n')
}
