//! Data contracts shared between ingestion, the categorization engine and
//! persistence.
//!
//! Transactions are owned by ingestion and treated as read-only input here.
//! Vendor rules are produced by the human-correction workflow. Decisions are
//! append-only audit records.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Upstream feed a transaction arrived from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionSource {
    BankFeed,
    Pos,
    Ecommerce,
}

impl TransactionSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BankFeed => "bank_feed",
            Self::Pos => "pos",
            Self::Ecommerce => "ecommerce",
        }
    }

    /// Parse stored value; unknown values are treated as bank feed rows
    pub fn parse(s: &str) -> Self {
        match s {
            "pos" => Self::Pos,
            "ecommerce" => Self::Ecommerce,
            _ => Self::BankFeed,
        }
    }
}

/// Normalized business transaction
///
/// `amount_cents` is exact. Negative amounts usually denote money out, but no
/// logic may rely on the sign alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedTransaction {
    pub id: String,
    pub org_id: String,
    pub date: NaiveDate,
    pub amount_cents: i64,
    pub currency: String,
    pub description: String,
    #[serde(default)]
    pub merchant_name: Option<String>,
    #[serde(default)]
    pub mcc: Option<String>,
    #[serde(default)]
    pub prior_category_id: Option<Uuid>,
    #[serde(default)]
    pub prior_confidence: Option<f64>,
    pub source: TransactionSource,
}

/// Match conditions of a vendor rule; every present field must match
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RulePattern {
    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(default)]
    pub mcc: Option<String>,
    /// Literal tokens, or `re:`-prefixed case-insensitive expressions
    #[serde(default)]
    pub description_tokens: Vec<String>,
}

impl RulePattern {
    /// True when the pattern constrains nothing
    pub fn is_empty(&self) -> bool {
        self.vendor.as_deref().map_or(true, |v| v.trim().is_empty())
            && self.mcc.as_deref().map_or(true, |m| m.trim().is_empty())
            && self.description_tokens.iter().all(|t| t.trim().is_empty())
    }
}

/// Per-organization categorization rule learned from corrections
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorRule {
    pub id: Uuid,
    pub org_id: String,
    pub pattern: RulePattern,
    pub category_id: Uuid,
    /// Corroboration count; confidence grows logarithmically with it
    pub weight: u32,
}

/// Cached vendor embedding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorEmbedding {
    pub vendor: String,
    pub embedding: Vec<f32>,
}

/// Which pass produced an audit decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Pass1,
    Llm,
    RecategorizationPass1,
    RecategorizationLlm,
    /// Row taken out of the backlog because it could not be read
    Quarantine,
}

impl DecisionSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass1 => "pass1",
            Self::Llm => "llm",
            Self::RecategorizationPass1 => "recategorization_pass1",
            Self::RecategorizationLlm => "recategorization_llm",
            Self::Quarantine => "quarantine",
        }
    }
}

/// Append-only audit record written for every categorization attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub id: Uuid,
    pub tx_id: String,
    pub org_id: String,
    pub source: DecisionSource,
    /// `None` records "could not categorize"
    pub category_id: Option<Uuid>,
    pub confidence: Option<f64>,
    pub rationale: Vec<String>,
    pub decided_by: String,
    pub created_at: DateTime<Utc>,
}

/// Category write applied to a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryUpdate {
    pub category_id: Option<Uuid>,
    pub confidence: Option<f64>,
    pub needs_review: bool,
    pub reviewed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_pattern_detection() {
        assert!(RulePattern::default().is_empty());
        assert!(RulePattern {
            vendor: Some("  ".into()),
            mcc: None,
            description_tokens: vec!["".into()],
        }
        .is_empty());
        assert!(!RulePattern {
            vendor: None,
            mcc: Some("7230".into()),
            description_tokens: vec![],
        }
        .is_empty());
    }

    #[test]
    fn test_decision_source_serializes_snake_case() {
        let json = serde_json::to_string(&DecisionSource::RecategorizationLlm).unwrap();
        assert_eq!(json, "\"recategorization_llm\"");
        assert_eq!(DecisionSource::Pass1.as_str(), "pass1");
    }

    #[test]
    fn test_transaction_source_round_trip_strings() {
        for s in [TransactionSource::BankFeed, TransactionSource::Pos, TransactionSource::Ecommerce] {
            assert_eq!(TransactionSource::parse(s.as_str()), s);
        }
    }
}
