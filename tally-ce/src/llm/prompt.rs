//! Prompt rendering for Pass-2
//!
//! The description cap is exact: it bounds token cost and keeps rendered
//! prompts deterministic.

use crate::taxonomy::{AccountingType, Taxonomy};
use std::collections::BTreeMap;
use std::fmt::Write;
use tally_common::models::NormalizedTransaction;

/// Maximum description length in characters, ellipsis included
pub const DESCRIPTION_CAP: usize = 160;

const ELLIPSIS: char = '…';

/// Collapse whitespace and cap at [`DESCRIPTION_CAP`] characters
pub fn truncate_description(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= DESCRIPTION_CAP {
        return collapsed;
    }
    let mut out: String = collapsed.chars().take(DESCRIPTION_CAP - 1).collect();
    out.push(ELLIPSIS);
    out
}

/// Signed dollars with exactly two decimals, computed on integer cents
pub fn format_amount(amount_cents: i64) -> String {
    let sign = if amount_cents < 0 { "-" } else { "" };
    let abs = amount_cents.unsigned_abs();
    format!("{}{}.{:02}", sign, abs / 100, abs % 100)
}

/// Prompt-eligible slugs grouped by accounting type
pub fn grouped_categories(taxonomy: &Taxonomy) -> BTreeMap<AccountingType, Vec<&'static str>> {
    let mut groups: BTreeMap<AccountingType, Vec<&'static str>> = BTreeMap::new();
    for node in taxonomy.prompt_categories() {
        groups.entry(node.accounting_type).or_default().push(node.slug);
    }
    groups
}

/// Render the categorization prompt for one transaction
pub fn build_prompt(tx: &NormalizedTransaction, taxonomy: &Taxonomy, industry: &str) -> String {
    let mut prompt = String::new();
    // Writing to a String cannot fail
    let _ = writeln!(
        prompt,
        "Categorize this business transaction for a {} business's Profit & Loss statement.",
        industry
    );
    let _ = writeln!(prompt);
    let _ = writeln!(prompt, "Merchant: {}", tx.merchant_name.as_deref().unwrap_or("unknown"));
    let _ = writeln!(prompt, "Description: {}", truncate_description(&tx.description));
    let _ = writeln!(prompt, "Amount: {} {}", format_amount(tx.amount_cents), tx.currency);
    if let Some(mcc) = tx.mcc.as_deref().map(str::trim).filter(|m| !m.is_empty()) {
        let _ = writeln!(prompt, "MCC: {}", mcc);
    }
    let _ = writeln!(prompt, "Industry: {}", industry);
    let _ = writeln!(prompt);
    let _ = writeln!(prompt, "Allowed category slugs:");
    for (accounting_type, slugs) in grouped_categories(taxonomy) {
        let _ = writeln!(prompt, "- {}: {}", accounting_type.as_str(), slugs.join(", "));
    }
    let _ = writeln!(prompt);
    let _ = write!(
        prompt,
        "Respond with one JSON object only: \
         {{\"category_slug\": \"<slug>\", \"confidence\": <0.0-1.0>, \"rationale\": \"<short reason>\"}}"
    );
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taxonomy::taxonomy;
    use chrono::NaiveDate;
    use tally_common::models::TransactionSource;

    fn tx(description: &str, amount_cents: i64, mcc: Option<&str>) -> NormalizedTransaction {
        NormalizedTransaction {
            id: "t".into(),
            org_id: "o".into(),
            date: NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
            amount_cents,
            currency: "USD".into(),
            description: description.into(),
            merchant_name: Some("Glow Studio".into()),
            mcc: mcc.map(str::to_string),
            prior_category_id: None,
            prior_confidence: None,
            source: TransactionSource::Pos,
        }
    }

    #[test]
    fn test_truncation_is_exact() {
        let long = "x".repeat(500);
        let t = truncate_description(&long);
        assert_eq!(t.chars().count(), DESCRIPTION_CAP);
        assert!(t.ends_with('…'));

        let exact = "y".repeat(DESCRIPTION_CAP);
        assert_eq!(truncate_description(&exact), exact);

        let one_over = "z".repeat(DESCRIPTION_CAP + 1);
        assert_eq!(truncate_description(&one_over).chars().count(), DESCRIPTION_CAP);
    }

    #[test]
    fn test_truncation_counts_characters_not_bytes() {
        let accented = "é".repeat(200);
        let t = truncate_description(&accented);
        assert_eq!(t.chars().count(), DESCRIPTION_CAP);
    }

    #[test]
    fn test_format_amount() {
        assert_eq!(format_amount(-1234), "-12.34");
        assert_eq!(format_amount(5), "0.05");
        assert_eq!(format_amount(0), "0.00");
        assert_eq!(format_amount(100_000), "1000.00");
        assert_eq!(format_amount(-7), "-0.07");
        assert_eq!(format_amount(i64::MIN), "-92233720368547758.08");
    }

    #[test]
    fn test_prompt_contents() {
        let prompt = build_prompt(&tx("Card   sale\n#88", -2599, Some("7230")), taxonomy(), "salon");
        assert!(prompt.contains("Merchant: Glow Studio"));
        assert!(prompt.contains("Description: Card sale #88"));
        assert!(prompt.contains("Amount: -25.99 USD"));
        assert!(prompt.contains("MCC: 7230"));
        assert!(prompt.contains("Industry: salon"));
        assert!(prompt.contains("- revenue: hair_services"));
        assert!(prompt.contains("sales_tax_payable"));
        assert!(!prompt.contains("owner_transfers"));
    }

    #[test]
    fn test_prompt_omits_missing_mcc() {
        let prompt = build_prompt(&tx("x", 100, None), taxonomy(), "salon");
        assert!(!prompt.contains("MCC:"));
    }
}
