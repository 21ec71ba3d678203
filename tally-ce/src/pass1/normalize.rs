//! Vendor-name normalization
//!
//! Lowercase, strip punctuation, drop trailing legal suffixes and collapse
//! whitespace. The output is a fixed point: normalizing it again is a no-op.

/// Trailing words that carry no vendor identity
const LEGAL_SUFFIXES: &[&str] = &["llc", "inc", "corp", "ltd", "co", "company"];

/// Normalize a vendor or merchant name for comparison
pub fn normalize_vendor(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect();

    let mut words: Vec<&str> = cleaned.split_whitespace().collect();
    // Keep at least one word so "Co" alone still names something
    while words.len() > 1 && words.last().map_or(false, |w| LEGAL_SUFFIXES.contains(w)) {
        words.pop();
    }
    words.join(" ")
}

/// Exact or either-direction containment on normalized names
pub fn vendors_match(a: &str, b: &str) -> bool {
    if a.is_empty() || b.is_empty() {
        return false;
    }
    a == b || a.contains(b) || b.contains(a)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_legal_suffix() {
        assert_eq!(normalize_vendor("Friendly Cuts LLC"), "friendly cuts");
        assert_eq!(normalize_vendor("  ACME, Inc. "), "acme");
        assert_eq!(normalize_vendor("Sally Beauty Supply Co"), "sally beauty supply");
        assert_eq!(normalize_vendor("Big Box Company Ltd."), "big box");
    }

    #[test]
    fn test_collapses_whitespace_and_punctuation() {
        assert_eq!(normalize_vendor("Joe's   Barber\tShop!"), "joes barber shop");
        assert_eq!(normalize_vendor("SQ *BLUE-BOTTLE"), "sq bluebottle");
    }

    #[test]
    fn test_suffix_only_name_is_kept() {
        assert_eq!(normalize_vendor("Co"), "co");
        assert_eq!(normalize_vendor(""), "");
        assert_eq!(normalize_vendor("!!!"), "");
    }

    #[test]
    fn test_idempotent() {
        for raw in [
            "Friendly Cuts LLC",
            "The Co Co",
            "  Inc Inc INC ",
            "Déjà Vu Salon, Ltd.",
            "a.b.c company",
            "",
            "123 Main St Corp",
        ] {
            let once = normalize_vendor(raw);
            assert_eq!(normalize_vendor(&once), once, "input {:?}", raw);
        }
    }

    #[test]
    fn test_vendors_match_containment() {
        assert!(vendors_match("friendly cuts", "friendly cuts"));
        assert!(vendors_match("friendly cuts downtown", "friendly cuts"));
        assert!(vendors_match("adobe", "adobe creative cloud"));
        assert!(!vendors_match("adobe", "stripe"));
        assert!(!vendors_match("", "stripe"));
    }
}
