//! Decision Arbiter
//!
//! Per-transaction state machine:
//! Pass-1, then Pass-2 only when Pass-1 is below threshold, the higher result
//! wins (ties keep Pass-1), guardrails apply to the winner, the category write
//! follows the auto-apply policy and exactly one audit decision is appended.

use crate::guardrails::GuardrailEnforcer;
use crate::llm::LlmClassifier;
use crate::pass1::{OrgCache, Pass1Classifier};
use crate::store::CategorizationStore;
use crate::taxonomy::{slugs, taxonomy, Taxonomy};
use crate::types::{CategorizationMode, CategorizationResult};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tally_common::config::EngineConfig;
use tally_common::models::{CategoryUpdate, Decision, DecisionSource, NormalizedTransaction};
use uuid::Uuid;

/// `decided_by` for deterministic decisions
pub const PASS1_DECIDER: &str = "categorizer";

/// What happened to one transaction
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionOutcome {
    pub tx_id: String,
    pub org_id: String,
    pub category_id: Option<Uuid>,
    pub confidence: Option<f64>,
    pub source: DecisionSource,
    pub needs_review: bool,
    /// Category write succeeded (false when nothing was written)
    pub applied: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub guardrail_violations: Vec<String>,
    #[serde(skip)]
    pub rate_limited: bool,
    #[serde(skip)]
    pub retry_after_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct Thresholds {
    pass2: f64,
    auto_apply: f64,
}

/// Combines both passes, the guardrails and the persistence writes
pub struct DecisionArbiter {
    pass1: Pass1Classifier,
    llm: LlmClassifier,
    guardrails: GuardrailEnforcer,
    store: Arc<dyn CategorizationStore>,
    config: EngineConfig,
    taxonomy: &'static Taxonomy,
}

impl DecisionArbiter {
    pub fn new(
        pass1: Pass1Classifier,
        llm: LlmClassifier,
        store: Arc<dyn CategorizationStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            pass1,
            llm,
            guardrails: GuardrailEnforcer::default(),
            store,
            config,
            taxonomy: taxonomy(),
        }
    }

    pub fn store(&self) -> &Arc<dyn CategorizationStore> {
        &self.store
    }

    pub fn llm_configured(&self) -> bool {
        self.llm.is_configured()
    }

    fn thresholds(&self, mode: CategorizationMode) -> Thresholds {
        match mode {
            CategorizationMode::Ingestion => Thresholds {
                pass2: self.config.pass2_threshold,
                auto_apply: self.config.auto_apply_threshold,
            },
            CategorizationMode::Recategorization => Thresholds {
                pass2: self.config.recategorization_pass2_threshold,
                auto_apply: self.config.recategorization_auto_apply_threshold,
            },
        }
    }

    /// Categorize, persist and audit one transaction
    ///
    /// # Arguments
    /// * `tx` - Transaction to categorize
    /// * `cache` - Rules and embeddings of the transaction's organization
    /// * `mode` - Selects thresholds and the review policy
    ///
    /// # Returns
    /// The outcome; failures are folded into it rather than returned
    pub async fn decide(
        &self,
        tx: &NormalizedTransaction,
        cache: &OrgCache,
        mode: CategorizationMode,
    ) -> TransactionOutcome {
        let thresholds = self.thresholds(mode);
        let pass1 = self.pass1.classify(tx, cache);

        let mut rate_limited = false;
        let mut retry_after_ms = None;

        let (mut winner, from_llm) = if pass1.rank() >= thresholds.pass2 {
            (pass1, false)
        } else {
            let outcome = self.llm.classify(tx).await;
            rate_limited = outcome.rate_limited;
            retry_after_ms = outcome.retry_after_ms;
            // Ties keep the deterministic answer
            if outcome.result.rank() > pass1.rank() {
                let mut merged = outcome.result;
                merged.rationale.extend(pass1.rationale.into_iter().map(|r| format!("pass1: {}", r)));
                (merged, true)
            } else {
                (pass1, false)
            }
        };

        let violations = self.enforce_guardrails(tx, &mut winner);

        let source = match (mode, from_llm) {
            (CategorizationMode::Ingestion, false) => DecisionSource::Pass1,
            (CategorizationMode::Ingestion, true) => DecisionSource::Llm,
            (CategorizationMode::Recategorization, false) => DecisionSource::RecategorizationPass1,
            (CategorizationMode::Recategorization, true) => DecisionSource::RecategorizationLlm,
        };
        let decided_by = if from_llm {
            self.llm.decided_by()
        } else {
            PASS1_DECIDER.to_string()
        };

        let needs_review = match (winner.category_id, winner.confidence) {
            (Some(category_id), Some(confidence)) => {
                let below = confidence < thresholds.auto_apply;
                match mode {
                    CategorizationMode::Ingestion => below,
                    CategorizationMode::Recategorization => {
                        below || tx.prior_category_id != Some(category_id)
                    }
                }
            }
            _ => true,
        };

        let (applied, error) = self.write_category(tx, &winner, needs_review, mode).await;

        tracing::debug!(
            tx_id = %tx.id,
            org_id = %tx.org_id,
            source = source.as_str(),
            category = ?winner.category_id,
            confidence = ?winner.confidence,
            needs_review,
            "Transaction decided"
        );

        let decision = Decision {
            id: Uuid::new_v4(),
            tx_id: tx.id.clone(),
            org_id: tx.org_id.clone(),
            source,
            category_id: winner.category_id,
            confidence: winner.confidence,
            rationale: winner.rationale.clone(),
            decided_by,
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.insert_decision(&decision).await {
            tracing::warn!(tx_id = %tx.id, org_id = %tx.org_id, error = %e, "Failed to record categorization decision");
        }

        TransactionOutcome {
            tx_id: tx.id.clone(),
            org_id: tx.org_id.clone(),
            category_id: winner.category_id,
            confidence: winner.confidence,
            source,
            needs_review,
            applied,
            guardrail_violations: violations,
            rate_limited,
            retry_after_ms,
            error,
        }
    }

    fn enforce_guardrails(&self, tx: &NormalizedTransaction, winner: &mut CategorizationResult) -> Vec<String> {
        let Some(category_id) = winner.category_id else {
            return Vec::new();
        };
        let slug = self
            .taxonomy
            .get_by_id(category_id)
            .map_or(slugs::OTHER_EXPENSES, |n| n.slug);
        let result = self
            .guardrails
            .apply(tx, slug, winner.confidence.unwrap_or(0.0));

        if !result.guardrails_applied.is_empty() {
            winner.category_id = Some(self.taxonomy.map_slug_to_id(&result.final_slug));
            winner
                .rationale
                .extend(result.violations.iter().map(|v| format!("guardrail: {}", v)));
        }
        winner.confidence = Some(result.final_confidence);
        result.violations
    }

    async fn write_category(
        &self,
        tx: &NormalizedTransaction,
        winner: &CategorizationResult,
        needs_review: bool,
        mode: CategorizationMode,
    ) -> (bool, Option<String>) {
        if winner.category_id.is_none() && mode == CategorizationMode::Recategorization {
            // Settled books keep their category when nothing better was found
            return (false, None);
        }

        let update = CategoryUpdate {
            category_id: winner.category_id,
            confidence: winner.confidence,
            needs_review,
            reviewed: false,
        };
        match self.store.update_transaction_category(&tx.id, &update).await {
            Ok(()) => (winner.category_id.is_some(), None),
            Err(e) => {
                tracing::warn!(tx_id = %tx.id, org_id = %tx.org_id, error = %e, "Failed to write transaction category");
                (false, Some(e.to_string()))
            }
        }
    }
}
