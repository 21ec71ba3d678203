//! Core result types shared by both passes, the guardrails and the arbiter.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Output of a single categorization pass
///
/// `category_id` and `confidence` are both `None` when the pass found nothing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategorizationResult {
    pub category_id: Option<Uuid>,
    pub confidence: Option<f64>,
    /// Ordered, short, human-readable reasons
    pub rationale: Vec<String>,
}

impl CategorizationResult {
    /// Empty result carrying a single rationale line
    pub fn empty(reason: impl Into<String>) -> Self {
        Self {
            category_id: None,
            confidence: None,
            rationale: vec![reason.into()],
        }
    }

    /// Confidence used for comparisons; missing confidence ranks lowest
    pub fn rank(&self) -> f64 {
        match (self.category_id, self.confidence) {
            (Some(_), Some(c)) if c.is_finite() => c,
            _ => f64::NEG_INFINITY,
        }
    }
}

/// A scored proposal from one Pass-1 heuristic
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub category_id: Uuid,
    pub confidence: f64,
    pub rationale: String,
}

/// Which workflow invoked the arbiter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategorizationMode {
    /// First-pass categorization of newly ingested transactions
    #[default]
    Ingestion,
    /// Historical re-categorization of settled books
    Recategorization,
}

/// Clamp to `[lo, hi]`, mapping non-finite values to `lo`
pub fn clamp_confidence(value: f64, lo: f64, hi: f64) -> f64 {
    if value.is_finite() {
        value.clamp(lo, hi)
    } else {
        lo
    }
}
