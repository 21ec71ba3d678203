//! Vendor rule matching
//!
//! A rule matches when every condition it carries matches. The heaviest
//! matching rule wins; earlier rules win ties.
//!
//! A defective rule fails scoring only for transactions its vendor and MCC
//! conditions reach. A defective rule without either condition (an empty
//! pattern, or tokens alone) reaches every transaction of its organization.

use super::cache::CompiledRule;
use super::normalize::{normalize_vendor, vendors_match};
use super::{OrgCache, Scorer};
use crate::error::ScoreError;
use crate::taxonomy::Taxonomy;
use crate::types::Candidate;
use tally_common::models::NormalizedTransaction;

/// Ceiling for rule-derived confidence
pub const MAX_RULE_CONFIDENCE: f64 = 0.95;

/// Saturating confidence for a rule corroborated `weight` times
pub fn rule_confidence(weight: u32) -> f64 {
    (0.70 + 0.05 * (1.0 + weight as f64).ln()).min(MAX_RULE_CONFIDENCE)
}

/// Does a compiled rule match the transaction?
///
/// Without a merchant name the rule vendor is looked for inside the description.
pub fn rule_matches(rule: &CompiledRule, tx: &NormalizedTransaction) -> bool {
    if !rule_reaches(rule, tx) {
        return false;
    }

    let description_lower = tx.description.to_lowercase();
    rule.tokens
        .iter()
        .all(|t| t.matches(&tx.description, &description_lower))
}

/// Vendor and MCC conditions only
pub fn rule_reaches(rule: &CompiledRule, tx: &NormalizedTransaction) -> bool {
    if let Some(vendor) = &rule.vendor {
        let merchant = tx
            .merchant_name
            .as_deref()
            .map(normalize_vendor)
            .filter(|m| !m.is_empty());
        let vendor_ok = match merchant {
            Some(merchant) => vendors_match(&merchant, vendor),
            None => normalize_vendor(&tx.description).contains(vendor.as_str()),
        };
        if !vendor_ok {
            return false;
        }
    }

    if let Some(mcc) = &rule.mcc {
        if tx.mcc.as_deref().map(str::trim) != Some(mcc.as_str()) {
            return false;
        }
    }

    true
}

/// Organization vendor-rule scorer
pub struct VendorRuleScorer {
    taxonomy: &'static Taxonomy,
}

impl VendorRuleScorer {
    pub fn new(taxonomy: &'static Taxonomy) -> Self {
        Self { taxonomy }
    }
}

impl Scorer for VendorRuleScorer {
    fn name(&self) -> &'static str {
        "vendor_rule"
    }

    fn score(&self, tx: &NormalizedTransaction, cache: &OrgCache) -> Result<Option<Candidate>, ScoreError> {
        let mut best: Option<&CompiledRule> = None;

        for compiled in &cache.rules {
            if let Some(defect) = &compiled.defect {
                if !rule_reaches(compiled, tx) {
                    continue;
                }
                return Err(ScoreError::MalformedRule {
                    rule_id: compiled.rule.id.to_string(),
                    reason: defect.clone(),
                });
            }
            if !rule_matches(compiled, tx) {
                continue;
            }
            if best.map_or(true, |b| compiled.rule.weight > b.rule.weight) {
                best = Some(compiled);
            }
        }

        let Some(winner) = best else {
            return Ok(None);
        };

        let Some(node) = self.taxonomy.get_by_id(winner.rule.category_id) else {
            return Err(ScoreError::MalformedRule {
                rule_id: winner.rule.id.to_string(),
                reason: format!("unknown category {}", winner.rule.category_id),
            });
        };

        let confidence = rule_confidence(winner.rule.weight);
        Ok(Some(Candidate {
            category_id: node.id,
            confidence,
            rationale: format!(
                "vendor rule {} (weight {}) matched {} ({:.4})",
                winner.rule.id, winner.rule.weight, node.slug, confidence
            ),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_correction_confidence() {
        let c = rule_confidence(1);
        assert!((c - (0.70 + 0.05 * 2f64.ln())).abs() < 1e-12);
        assert!((c - 0.7347).abs() < 1e-4);
    }

    #[test]
    fn test_confidence_grows_but_saturates() {
        let ten = rule_confidence(10);
        assert!(ten > rule_confidence(1));
        assert!(ten < MAX_RULE_CONFIDENCE);
        assert_eq!(rule_confidence(u32::MAX), MAX_RULE_CONFIDENCE);
        let mut last = 0.0;
        for w in 1..500 {
            let c = rule_confidence(w);
            assert!(c >= last);
            assert!(c <= MAX_RULE_CONFIDENCE);
            last = c;
        }
    }
}
