//! Guardrail Enforcer
//!
//! Post-processes a proposed (category, confidence) pair against patterns
//! that are financially wrong regardless of how confident a pass was.
//! Checks run in a fixed order, each on the output of the previous one;
//! redirects and penalties accumulate and confidence never increases.

use crate::taxonomy::{slugs, taxonomy, AccountingType, Taxonomy};
use crate::types::clamp_confidence;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tally_common::models::NormalizedTransaction;

pub const REFUND_PENALTY: f64 = 0.4;
pub const PROCESSOR_PENALTY: f64 = 0.3;
pub const SALES_TAX_PENALTY: f64 = 0.2;
pub const PAYOUT_PENALTY: f64 = 0.1;

static REFUND_KEYWORDS: Lazy<Option<Regex>> = Lazy::new(|| {
    compile(r"(?i)\b(refund(s|ed)?|chargebacks?|charge back|reversals?|reversed|disputes?|disputed)\b")
});

static PROCESSOR_NAMES: Lazy<Option<Regex>> = Lazy::new(|| {
    compile(r"(?i)\b(stripe|square|squareup|paypal|shopify payments|clover|braintree|adyen|sumup|venmo business)\b")
});

static TAX_AUTHORITY_KEYWORDS: Lazy<Option<Regex>> = Lazy::new(|| {
    compile(
        r"(?i)\b(sales tax|sales and use tax|department of revenue|dept\.? of revenue|comptroller|franchise tax board|cdtfa|tax collector|board of equalization)\b",
    )
});

static PAYOUT_KEYWORDS: Lazy<Option<Regex>> = Lazy::new(|| compile(r"(?i)\b(payouts?|settlements?)\b"));

static TRANSFER_KEYWORDS: Lazy<Option<Regex>> = Lazy::new(|| compile(r"(?i)\b(transfers?|deposits?)\b"));

fn compile(expr: &str) -> Option<Regex> {
    match Regex::new(expr) {
        Ok(re) => Some(re),
        Err(e) => {
            tracing::error!(pattern = expr, error = %e, "Guardrail keyword pattern failed to compile");
            None
        }
    }
}

fn is_match(re: &Lazy<Option<Regex>>, text: &str) -> bool {
    re.as_ref().map_or(false, |re| re.is_match(text))
}

/// Verdict of a single guardrail check
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GuardrailOutcome {
    pub allowed: bool,
    pub reason: Option<String>,
    pub suggested_category_slug: Option<&'static str>,
    pub confidence_penalty: Option<f64>,
}

impl GuardrailOutcome {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            suggested_category_slug: None,
            confidence_penalty: None,
        }
    }

    fn redirect(slug: &'static str, penalty: f64, reason: String) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            suggested_category_slug: Some(slug),
            confidence_penalty: Some(penalty),
        }
    }
}

/// Combined result of all checks
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GuardrailResult {
    pub final_slug: String,
    /// Finite, within `[0, 1]`
    pub final_confidence: f64,
    /// Names of guardrails that redirected the proposal
    pub guardrails_applied: Vec<&'static str>,
    pub violations: Vec<String>,
}

type Check = fn(&GuardrailEnforcer, &NormalizedTransaction, &str) -> GuardrailOutcome;

/// Domain guardrails over a taxonomy
pub struct GuardrailEnforcer {
    taxonomy: &'static Taxonomy,
}

impl Default for GuardrailEnforcer {
    fn default() -> Self {
        Self::new(taxonomy())
    }
}

fn searchable_text(tx: &NormalizedTransaction) -> String {
    match tx.merchant_name.as_deref() {
        Some(m) => format!("{} {}", tx.description, m),
        None => tx.description.clone(),
    }
}

impl GuardrailEnforcer {
    pub fn new(taxonomy: &'static Taxonomy) -> Self {
        Self { taxonomy }
    }

    /// Refunds and processor flows must not land in revenue
    pub fn check_revenue(&self, tx: &NormalizedTransaction, slug: &str) -> GuardrailOutcome {
        if self.taxonomy.accounting_type_of(slug) != Some(AccountingType::Revenue)
            || slug == slugs::REFUNDS_ALLOWANCES
        {
            return GuardrailOutcome::allow();
        }

        let text = searchable_text(tx);
        if is_match(&REFUND_KEYWORDS, &text) {
            return GuardrailOutcome::redirect(
                slugs::REFUNDS_ALLOWANCES,
                REFUND_PENALTY,
                format!("revenue blocked: refund keywords in {:?}", tx.description),
            );
        }
        if tx.amount_cents < 0 {
            return GuardrailOutcome::redirect(
                slugs::REFUNDS_ALLOWANCES,
                REFUND_PENALTY,
                format!("revenue blocked: negative amount {}", tx.amount_cents),
            );
        }
        if let Some(merchant) = tx.merchant_name.as_deref() {
            if is_match(&PROCESSOR_NAMES, merchant) {
                return GuardrailOutcome::redirect(
                    slugs::PAYMENT_PROCESSING_FEES,
                    PROCESSOR_PENALTY,
                    format!("revenue blocked: payment processor merchant {:?}", merchant),
                );
            }
        }
        GuardrailOutcome::allow()
    }

    /// Tax remittances belong to the (non-P&L) sales tax liability
    pub fn check_sales_tax(&self, tx: &NormalizedTransaction, slug: &str) -> GuardrailOutcome {
        if slug == slugs::SALES_TAX_PAYABLE || !is_match(&TAX_AUTHORITY_KEYWORDS, &searchable_text(tx)) {
            return GuardrailOutcome::allow();
        }
        GuardrailOutcome::redirect(
            slugs::SALES_TAX_PAYABLE,
            SALES_TAX_PENALTY,
            format!("tax authority transaction proposed as {}", slug),
        )
    }

    /// Platform payouts are money in transit, not revenue or expense
    pub fn check_payout_clearing(&self, tx: &NormalizedTransaction, slug: &str) -> GuardrailOutcome {
        if slug == slugs::PAYOUTS_CLEARING {
            return GuardrailOutcome::allow();
        }
        let text = searchable_text(tx);
        let is_payout = is_match(&PAYOUT_KEYWORDS, &text)
            || (is_match(&PROCESSOR_NAMES, &text) && is_match(&TRANSFER_KEYWORDS, &text));
        if !is_payout {
            return GuardrailOutcome::allow();
        }
        GuardrailOutcome::redirect(
            slugs::PAYOUTS_CLEARING,
            PAYOUT_PENALTY,
            format!("platform payout proposed as {}", slug),
        )
    }

    /// Run all checks in order on a proposal
    pub fn apply(&self, tx: &NormalizedTransaction, proposed_slug: &str, confidence: f64) -> GuardrailResult {
        const CHECKS: [(&str, Check); 3] = [
            ("revenue", GuardrailEnforcer::check_revenue),
            ("sales_tax", GuardrailEnforcer::check_sales_tax),
            ("payout_clearing", GuardrailEnforcer::check_payout_clearing),
        ];

        let mut slug = proposed_slug.to_string();
        let mut conf = if confidence.is_finite() { confidence } else { 0.0 };
        let mut guardrails_applied = Vec::new();
        let mut violations = Vec::new();

        for (name, check) in CHECKS {
            let outcome = check(self, tx, &slug);
            if outcome.allowed {
                continue;
            }
            if let Some(reason) = outcome.reason {
                violations.push(reason);
            }
            if let Some(penalty) = outcome.confidence_penalty {
                conf -= clamp_confidence(penalty, 0.0, 1.0);
            }
            if let Some(next) = outcome.suggested_category_slug {
                tracing::debug!(
                    tx_id = %tx.id,
                    guardrail = name,
                    from = %slug,
                    to = next,
                    "Guardrail redirected category"
                );
                slug = next.to_string();
            }
            guardrails_applied.push(name);
        }

        GuardrailResult {
            final_slug: slug,
            final_confidence: clamp_confidence(conf, 0.0, 1.0),
            guardrails_applied,
            violations,
        }
    }
}

/// Apply the standard guardrails
pub fn apply_guardrails(tx: &NormalizedTransaction, proposed_slug: &str, confidence: f64) -> GuardrailResult {
    GuardrailEnforcer::default().apply(tx, proposed_slug, confidence)
}
