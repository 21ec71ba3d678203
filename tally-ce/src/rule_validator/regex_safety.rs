//! Static checks on rule expressions
//!
//! The engine's own regex crate runs in linear time, but rule sets are
//! exported to other consumers with backtracking engines, so expressions are
//! held to the stricter standard.

use regex::RegexBuilder;

/// Problem found in one expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegexIssue {
    Invalid(String),
    /// Matches the empty string, so it matches every description
    MatchesEmpty,
    /// A quantified group that itself contains a quantifier, e.g. `(a+)+`
    NestedQuantifier,
}

impl RegexIssue {
    pub fn describe(&self) -> String {
        match self {
            Self::Invalid(e) => format!("does not compile: {}", e),
            Self::MatchesEmpty => "matches the empty string".to_string(),
            Self::NestedQuantifier => "nested quantifier (catastrophic backtracking risk)".to_string(),
        }
    }
}

/// Inspect one expression
pub fn check_expression(expr: &str) -> Vec<RegexIssue> {
    let mut issues = Vec::new();
    match RegexBuilder::new(expr).case_insensitive(true).build() {
        Ok(re) => {
            if re.is_match("") {
                issues.push(RegexIssue::MatchesEmpty);
            }
        }
        Err(e) => {
            issues.push(RegexIssue::Invalid(e.to_string()));
            return issues;
        }
    }
    if has_nested_quantifier(expr) {
        issues.push(RegexIssue::NestedQuantifier);
    }
    issues
}

fn is_quantifier(c: char) -> bool {
    matches!(c, '*' | '+' | '{')
}

/// Scan for a group containing a repetition that is itself repeated
pub fn has_nested_quantifier(expr: &str) -> bool {
    // One flag per open group: does it contain a repetition?
    let mut groups: Vec<bool> = Vec::new();
    let mut chars = expr.chars().peekable();
    let mut in_class = false;

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                chars.next();
            }
            '[' if !in_class => in_class = true,
            ']' if in_class => in_class = false,
            _ if in_class => {}
            '(' => groups.push(false),
            ')' => {
                let Some(inner_repeats) = groups.pop() else {
                    continue;
                };
                let outer_repeats = chars.peek().copied().map_or(false, is_quantifier);
                if inner_repeats && outer_repeats {
                    return true;
                }
                if let Some(parent) = groups.last_mut() {
                    *parent |= inner_repeats || outer_repeats;
                }
            }
            c if is_quantifier(c) => {
                if let Some(current) = groups.last_mut() {
                    *current = true;
                }
            }
            _ => {}
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_quantifiers_detected() {
        assert!(has_nested_quantifier("(a+)+"));
        assert!(has_nested_quantifier("^(\\w+\\s?)*$"));
        assert!(has_nested_quantifier("((ab)*c)+"));
        assert!(has_nested_quantifier("(x{2,})*"));
    }

    #[test]
    fn test_safe_expressions_pass() {
        assert!(!has_nested_quantifier("(?i)\\b(refund|chargeback)\\b"));
        assert!(!has_nested_quantifier("(ab)+"));
        assert!(!has_nested_quantifier("[(+)]+"));
        assert!(!has_nested_quantifier("\\(a+\\)+"));
        assert!(check_expression("^sq \\*").is_empty());
    }

    #[test]
    fn test_empty_match_and_invalid() {
        assert_eq!(check_expression("a*"), vec![RegexIssue::MatchesEmpty]);
        assert!(matches!(check_expression("(unclosed").as_slice(), [RegexIssue::Invalid(_)]));
    }
}
