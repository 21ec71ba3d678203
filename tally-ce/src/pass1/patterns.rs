//! Description pattern rules tuned for appointment-based service businesses

use super::{OrgCache, Scorer};
use crate::error::ScoreError;
use crate::taxonomy::{slugs, Taxonomy};
use crate::types::Candidate;
use once_cell::sync::Lazy;
use regex::Regex;
use tally_common::models::NormalizedTransaction;

/// Confidence for any description-pattern match
pub const PATTERN_CONFIDENCE: f64 = 0.75;

/// Ordered (expression, category slug); first match wins
#[rustfmt::skip]
pub const DESCRIPTION_PATTERNS: &[(&str, &str)] = &[
    (r"(?i)\b(refund|chargeback|reversal)\b", slugs::REFUNDS_ALLOWANCES),
    (r"(?i)\b(sales tax|department of revenue|dept of revenue|tax payment)\b", slugs::SALES_TAX_PAYABLE),
    (r"(?i)\b(payout|settlement)\b", slugs::PAYOUTS_CLEARING),
    (r"(?i)\b(stripe|square|paypal|clover|shopify)\b.*\bfees?\b", slugs::PAYMENT_PROCESSING_FEES),
    (r"(?i)\b(rent|lease)\b", "rent"),
    (r"(?i)\b(payroll|gusto|adp)\b", "payroll"),
    (r"(?i)\b(electric|water bill|gas bill|utility|utilities|comcast|verizon)\b", "utilities"),
    (r"(?i)\binsurance\b", "insurance"),
    (r"(?i)\b(facebook ads|google ads|meta ads|yelp ads|instagram)\b", "marketing"),
    (r"(?i)\b(adobe|quickbooks|vagaro|boulevard|mindbody|subscription)\b", "software_subscriptions"),
    (r"(?i)\b(service charge|monthly maintenance fee|overdraft|wire fee)\b", "bank_fees"),
    (r"(?i)\b(sally beauty|cosmoprof|salon ?centric)\b", "salon_supplies"),
    (r"(?i)\b(haircut|hair cut|blowout|trim|barber)\b", slugs::HAIR_SERVICES),
    (r"(?i)\b(color|highlights|balayage|toner)\b", "color_services"),
    (r"(?i)\b(manicure|pedicure|gel nails?|acrylics?)\b", "nail_services"),
    (r"(?i)\b(facial|massage|waxing)\b", "spa_services"),
    (r"(?i)\b(uber|lyft|airline|hotel)\b", "travel"),
];

/// Compiled pattern table; entries that fail to compile are dropped
static COMPILED: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    DESCRIPTION_PATTERNS
        .iter()
        .filter_map(|&(expr, slug)| match Regex::new(expr) {
            Ok(re) => Some((re, slug)),
            Err(e) => {
                tracing::error!(pattern = expr, error = %e, "Description pattern failed to compile");
                None
            }
        })
        .collect()
});

/// First matching description pattern, if any
pub fn match_description(text: &str) -> Option<&'static str> {
    COMPILED
        .iter()
        .find(|(re, _)| re.is_match(text))
        .map(|&(_, slug)| slug)
}

/// Fixed-confidence description pattern scorer
pub struct PatternScorer {
    taxonomy: &'static Taxonomy,
}

impl PatternScorer {
    pub fn new(taxonomy: &'static Taxonomy) -> Self {
        Self { taxonomy }
    }
}

impl Scorer for PatternScorer {
    fn name(&self) -> &'static str {
        "description_pattern"
    }

    fn score(&self, tx: &NormalizedTransaction, _cache: &OrgCache) -> Result<Option<Candidate>, ScoreError> {
        let Some(slug) = match_description(&tx.description) else {
            return Ok(None);
        };
        Ok(self.taxonomy.get_by_slug(slug).map(|node| Candidate {
            category_id: node.id,
            confidence: PATTERN_CONFIDENCE,
            rationale: format!("description pattern matched {} ({:.2})", slug, PATTERN_CONFIDENCE),
        }))
    }
}
