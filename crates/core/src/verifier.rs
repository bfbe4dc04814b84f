//! Verifier trait: an independent judgment of whether a request is done.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::message::Message;

/// The verifier's judgment of a candidate final answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub is_complete: bool,

    #[serde(default)]
    pub missing_items: Vec<String>,

    #[serde(default)]
    pub reason: String,

    /// 0.0 to 1.0
    #[serde(default)]
    pub confidence: f32,
}

impl Verdict {
    pub fn complete(reason: impl Into<String>) -> Self {
        Self {
            is_complete: true,
            missing_items: Vec::new(),
            reason: reason.into(),
            confidence: 1.0,
        }
    }

    pub fn incomplete(missing_items: Vec<String>, reason: impl Into<String>) -> Self {
        Self {
            is_complete: false,
            missing_items,
            reason: reason.into(),
            confidence: 1.0,
        }
    }
}

/// Judges a transcript whose last assistant turn is a candidate answer.
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self, messages: &[Message]) -> Result<Verdict>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_parses_camel_case() {
        let v: Verdict = serde_json::from_str(
            r#"{"isComplete": false, "missingItems": ["run tests"], "reason": "tests not run", "confidence": 0.8}"#,
        )
        .unwrap();
        assert!(!v.is_complete);
        assert_eq!(v.missing_items, vec!["run tests"]);
        assert!((v.confidence - 0.8).abs() < f32::EPSILON);
    }

    #[test]
    fn verdict_optional_fields_default() {
        let v: Verdict = serde_json::from_str(r#"{"isComplete": true}"#).unwrap();
        assert!(v.is_complete);
        assert!(v.missing_items.is_empty());
        assert!(v.reason.is_empty());
    }
}
