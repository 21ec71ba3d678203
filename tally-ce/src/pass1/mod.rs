//! Pass-1 Deterministic Classifier
//!
//! An ordered list of scorers is folded left to right; a later scorer only
//! replaces the running best candidate when its confidence is strictly
//! higher. Similar-vendor evidence then adds a flat boost to an existing
//! candidate (it never originates one) and the result is clamped to
//! `[0, PASS1_CEILING]`.
//!
//! Pass-1 never fails: scorer errors become an empty result.

pub mod cache;
pub mod mcc;
pub mod normalize;
pub mod patterns;
pub mod vendor_rules;

pub use cache::OrgCache;

use crate::error::ScoreError;
use crate::taxonomy::{taxonomy, Taxonomy};
use crate::types::{clamp_confidence, CategorizationResult, Candidate};
use normalize::normalize_vendor;
use tally_common::models::NormalizedTransaction;

/// Highest confidence Pass-1 may report
pub const PASS1_CEILING: f64 = 0.98;

/// Default similar-vendor boost
pub const DEFAULT_EMBEDDING_BOOST: f64 = 0.05;

/// One deterministic heuristic
pub trait Scorer: Send + Sync {
    /// Scorer name for logs
    fn name(&self) -> &'static str;

    /// Propose a category, or `None` when the heuristic has no opinion
    fn score(&self, tx: &NormalizedTransaction, cache: &OrgCache) -> Result<Option<Candidate>, ScoreError>;
}

/// Deterministic classifier
pub struct Pass1Classifier {
    scorers: Vec<Box<dyn Scorer>>,
    embedding_boost: f64,
}

impl Default for Pass1Classifier {
    fn default() -> Self {
        Self::standard(taxonomy(), DEFAULT_EMBEDDING_BOOST)
    }
}

impl Pass1Classifier {
    /// MCC → vendor rules → description patterns
    pub fn standard(taxonomy: &'static Taxonomy, embedding_boost: f64) -> Self {
        Self::with_scorers(
            vec![
                Box::new(mcc::MccScorer::new(taxonomy)),
                Box::new(vendor_rules::VendorRuleScorer::new(taxonomy)),
                Box::new(patterns::PatternScorer::new(taxonomy)),
            ],
            embedding_boost,
        )
    }

    pub fn with_scorers(scorers: Vec<Box<dyn Scorer>>, embedding_boost: f64) -> Self {
        Self {
            scorers,
            embedding_boost: clamp_confidence(embedding_boost, 0.0, 1.0),
        }
    }

    /// Categorize one transaction
    pub fn classify(&self, tx: &NormalizedTransaction, cache: &OrgCache) -> CategorizationResult {
        let mut best: Option<Candidate> = None;
        let mut rationale: Vec<String> = Vec::new();

        for scorer in &self.scorers {
            match scorer.score(tx, cache) {
                Ok(Some(candidate)) => {
                    let improves = best
                        .as_ref()
                        .map_or(true, |b| candidate.confidence > b.confidence);
                    tracing::debug!(
                        tx_id = %tx.id,
                        scorer = scorer.name(),
                        confidence = candidate.confidence,
                        improves,
                        "Pass-1 candidate"
                    );
                    if improves {
                        rationale.push(candidate.rationale.clone());
                        best = Some(candidate);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(
                        tx_id = %tx.id,
                        org_id = %tx.org_id,
                        scorer = scorer.name(),
                        error = %e,
                        "Pass-1 scorer failed, returning empty result"
                    );
                    return CategorizationResult::empty(format!("pass1 error: {}", e));
                }
            }
        }

        let Some(mut winner) = best else {
            return CategorizationResult::empty("pass1: no deterministic match");
        };

        if self.embedding_boost > 0.0 {
            if let Some(merchant) = tx.merchant_name.as_deref().map(normalize_vendor) {
                if cache.has_similar_vendor(&merchant) {
                    winner.confidence += self.embedding_boost;
                    rationale.push(format!("similar vendor evidence +{:.2}", self.embedding_boost));
                }
            }
        }

        CategorizationResult {
            category_id: Some(winner.category_id),
            confidence: Some(clamp_confidence(winner.confidence, 0.0, PASS1_CEILING)),
            rationale,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taxonomy::slugs;
    use chrono::NaiveDate;
    use tally_common::models::{RulePattern, TransactionSource, VendorEmbedding, VendorRule};
    use uuid::Uuid;

    fn tx(description: &str, merchant: Option<&str>, mcc: Option<&str>) -> NormalizedTransaction {
        NormalizedTransaction {
            id: "tx-1".into(),
            org_id: "org-1".into(),
            date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            amount_cents: -4_500,
            currency: "USD".into(),
            description: description.into(),
            merchant_name: merchant.map(str::to_string),
            mcc: mcc.map(str::to_string),
            prior_category_id: None,
            prior_confidence: None,
            source: TransactionSource::BankFeed,
        }
    }

    fn vendor_rule(vendor: &str, slug: &str, weight: u32) -> VendorRule {
        VendorRule {
            id: Uuid::new_v4(),
            org_id: "org-1".into(),
            pattern: RulePattern {
                vendor: Some(vendor.into()),
                ..Default::default()
            },
            category_id: taxonomy().get_by_slug(slug).unwrap().id,
            weight,
        }
    }

    fn id_of(slug: &str) -> Uuid {
        taxonomy().get_by_slug(slug).unwrap().id
    }

    #[test]
    fn test_mcc_hair_services_exact_confidence() {
        let classifier = Pass1Classifier::default();
        let result = classifier.classify(&tx("POS PURCHASE", Some("Shear Bliss"), Some("7230")), &OrgCache::default());
        assert_eq!(result.category_id, Some(id_of(slugs::HAIR_SERVICES)));
        assert_eq!(result.confidence, Some(0.90));
        assert!(result.rationale.iter().any(|r| r.contains("7230")));
    }

    #[test]
    fn test_vendor_rule_weight_one() {
        let cache = OrgCache::from_parts("org-1", vec![vendor_rule("Friendly Cuts LLC", "contract_labor", 1)], vec![]);
        let result = Pass1Classifier::default().classify(&tx("ACH DEBIT", Some("FRIENDLY CUTS"), None), &cache);
        assert_eq!(result.category_id, Some(id_of("contract_labor")));
        let expected = (0.70 + 0.05 * 2f64.ln()).min(0.95);
        assert!((result.confidence.unwrap() - expected).abs() < 1e-12);
    }

    #[test]
    fn test_vendor_rule_weight_ten_is_higher_but_capped() {
        let cache = OrgCache::from_parts("org-1", vec![vendor_rule("Friendly Cuts", "contract_labor", 10)], vec![]);
        let c = Pass1Classifier::default()
            .classify(&tx("ACH DEBIT", Some("Friendly Cuts Inc"), None), &cache)
            .confidence
            .unwrap();
        assert!(c > 0.7348 && c < 0.95);
    }

    #[test]
    fn test_later_stage_needs_strictly_higher_confidence() {
        // MCC gives 0.90; a weight-1 rule (0.7347) must not override it
        let cache = OrgCache::from_parts("org-1", vec![vendor_rule("Shear Bliss", "rent", 1)], vec![]);
        let result = Pass1Classifier::default().classify(&tx("POS", Some("Shear Bliss"), Some("7230")), &cache);
        assert_eq!(result.category_id, Some(id_of(slugs::HAIR_SERVICES)));
    }

    #[test]
    fn test_pattern_match_medium_confidence() {
        let result = Pass1Classifier::default().classify(&tx("MONTHLY RENT SUITE 4", None, None), &OrgCache::default());
        assert_eq!(result.category_id, Some(id_of("rent")));
        assert_eq!(result.confidence, Some(patterns::PATTERN_CONFIDENCE));
    }

    #[test]
    fn test_embedding_boost_only_raises_existing_candidate() {
        let embeddings = vec![VendorEmbedding {
            vendor: "Landlord Properties".into(),
            embedding: vec![0.3; 4],
        }];
        let cache = OrgCache::from_parts("org-1", vec![], embeddings);
        let classifier = Pass1Classifier::default();

        let boosted = classifier.classify(&tx("rent march", Some("Landlord Properties LLC"), None), &cache);
        assert!((boosted.confidence.unwrap() - 0.80).abs() < 1e-12);

        let unmatched = classifier.classify(&tx("misc", Some("Landlord Properties"), None), &cache);
        assert_eq!(unmatched.category_id, None);
        assert_eq!(unmatched.confidence, None);
    }

    #[test]
    fn test_clamped_below_ceiling() {
        let embeddings = vec![VendorEmbedding {
            vendor: "Gusto".into(),
            embedding: vec![],
        }];
        let cache = OrgCache::from_parts("org-1", vec![vendor_rule("Gusto", "payroll", 10_000)], embeddings);
        let result = Pass1Classifier::with_scorers(
            vec![Box::new(vendor_rules::VendorRuleScorer::new(taxonomy()))],
            0.5,
        )
        .classify(&tx("GUSTO PAYROLL", Some("Gusto"), None), &cache);
        assert_eq!(result.confidence, Some(PASS1_CEILING));
    }

    #[test]
    fn test_malformed_rule_yields_empty_result() {
        let mut bad = vendor_rule("Anything", "rent", 1);
        bad.pattern.description_tokens = vec!["re:([a-z".into()];
        let cache = OrgCache::from_parts("org-1", vec![bad], vec![]);
        let result = Pass1Classifier::default().classify(&tx("rent", Some("Anything"), Some("7230")), &cache);
        assert_eq!(result.category_id, None);
        assert_eq!(result.confidence, None);
        assert!(result.rationale[0].starts_with("pass1 error"));
    }

    #[test]
    fn test_malformed_rule_for_other_vendor_leaves_mcc_hit_alone() {
        let mut bad = vendor_rule("Oak Properties", "rent", 1);
        bad.pattern.description_tokens = vec!["re:([a-z".into()];
        let cache = OrgCache::from_parts("org-1", vec![bad], vec![]);
        let classifier = Pass1Classifier::default();

        let hit = classifier.classify(&tx("POS PURCHASE", Some("Shear Bliss"), Some("7230")), &cache);
        assert_eq!(hit.category_id, Some(id_of(slugs::HAIR_SERVICES)));
        assert_eq!(hit.confidence, Some(0.90));

        let reached = classifier.classify(&tx("POS PURCHASE", Some("Oak Properties"), Some("7230")), &cache);
        assert_eq!(reached.category_id, None);
        assert!(reached.rationale[0].starts_with("pass1 error"));
    }

    #[test]
    fn test_rule_with_unknown_category_yields_empty_result() {
        let mut rule = vendor_rule("Mystery Vendor", "rent", 2);
        rule.category_id = Uuid::from_u128(99);
        let cache = OrgCache::from_parts("org-1", vec![rule], vec![]);
        let result = Pass1Classifier::default().classify(&tx("x", Some("Mystery Vendor"), None), &cache);
        assert!(result.category_id.is_none());
    }

    #[test]
    fn test_no_match_is_empty_not_error() {
        let result = Pass1Classifier::default().classify(&tx("coffee beans", Some("Roastery"), None), &OrgCache::default());
        assert!(result.category_id.is_none());
        assert_eq!(result.rationale, vec!["pass1: no deterministic match".to_string()]);
    }
}
