//! Merchant Category Code lookup

use super::{OrgCache, Scorer};
use crate::error::ScoreError;
use crate::taxonomy::{slugs, Taxonomy};
use crate::types::Candidate;
use tally_common::models::NormalizedTransaction;

/// MCC → (category slug, fixed confidence)
#[rustfmt::skip]
const MCC_TABLE: &[(&str, &str, f64)] = &[
    ("7230", slugs::HAIR_SERVICES, 0.90),         // Beauty and barber shops
    ("7298", "spa_services", 0.85),               // Health and beauty spas
    ("5977", "salon_supplies", 0.85),             // Cosmetic stores
    ("5122", "salon_supplies", 0.85),             // Drugs, proprietaries, sundries
    ("4900", "utilities", 0.90),                  // Utilities
    ("4814", "utilities", 0.85),                  // Telecommunication services
    ("4899", "utilities", 0.85),                  // Cable and streaming
    ("5734", "software_subscriptions", 0.85),     // Computer software stores
    ("5817", "software_subscriptions", 0.85),     // Digital goods: applications
    ("7311", "marketing", 0.90),                  // Advertising services
    ("6300", "insurance", 0.90),                  // Insurance sales and premiums
    ("8111", "professional_services", 0.90),      // Legal services
    ("8931", "professional_services", 0.90),      // Accounting and bookkeeping
    ("6513", "rent", 0.85),                       // Real estate agents and rentals
    ("5812", "meals", 0.85),                      // Restaurants
    ("5814", "meals", 0.85),                      // Fast food
    ("4511", "travel", 0.90),                     // Airlines
    ("7011", "travel", 0.90),                     // Lodging
    ("4121", "travel", 0.85),                     // Taxis and rideshare
    ("7349", "repairs_maintenance", 0.85),        // Cleaning and maintenance
    ("8299", "education_training", 0.85),         // Schools and educational services
    ("9311", slugs::SALES_TAX_PAYABLE, 0.85),     // Tax payments
];

/// Fixed confidence for a known MCC
pub fn lookup_mcc(mcc: &str) -> Option<(&'static str, f64)> {
    let mcc = mcc.trim();
    MCC_TABLE
        .iter()
        .find(|(code, _, _)| *code == mcc)
        .map(|&(_, slug, confidence)| (slug, confidence))
}

/// Exact MCC table lookup
pub struct MccScorer {
    taxonomy: &'static Taxonomy,
}

impl MccScorer {
    pub fn new(taxonomy: &'static Taxonomy) -> Self {
        Self { taxonomy }
    }
}

impl Scorer for MccScorer {
    fn name(&self) -> &'static str {
        "mcc"
    }

    fn score(&self, tx: &NormalizedTransaction, _cache: &OrgCache) -> Result<Option<Candidate>, ScoreError> {
        let Some(mcc) = tx.mcc.as_deref() else {
            return Ok(None);
        };
        let Some((slug, confidence)) = lookup_mcc(mcc) else {
            return Ok(None);
        };
        Ok(self.taxonomy.get_by_slug(slug).map(|node| Candidate {
            category_id: node.id,
            confidence,
            rationale: format!("mcc {} matched {} ({:.2})", mcc.trim(), slug, confidence),
        }))
    }
}
