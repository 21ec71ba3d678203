//! Rule Validator (offline static analysis of vendor rules)
//!
//! Checks, per organization:
//! 1. Rule integrity (unreadable row, unknown category, empty pattern, zero weight,
//!    invalid expression)
//! 2. Expression safety for `re:` tokens and the built-in description patterns
//! 3. Conflicts: rules that can match the same transaction but disagree on category
//! 4. Dead rules: rules always overridden by a higher-precedence rule

pub mod regex_safety;
pub mod report;

pub use report::write_reports;

use crate::pass1::cache::{CompiledRule, REGEX_TOKEN_PREFIX};
use crate::pass1::patterns::DESCRIPTION_PATTERNS;
use crate::store::{RuleListing, UndecodableRule};
use crate::taxonomy::Taxonomy;
use chrono::{DateTime, Utc};
use regex_safety::{check_expression, RegexIssue};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tally_common::models::VendorRule;

/// `tally-rv` exit code when critical issues were found
pub const EXIT_CRITICAL: u8 = 1;

/// `tally-rv` exit code when validation could not run (config, database, report output)
pub const EXIT_TOOL_ERROR: u8 = 2;

/// Issue severity; `Critical` fails the validation gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    Conflict,
    UnsafeRegex,
    DeadRule,
    UnknownCategory,
    EmptyPattern,
    ZeroWeight,
    /// Stored row could not be read as a rule
    UndecodableRule,
}

impl IssueKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Conflict => "conflict",
            Self::UnsafeRegex => "unsafe_regex",
            Self::DeadRule => "dead_rule",
            Self::UnknownCategory => "unknown_category",
            Self::EmptyPattern => "empty_pattern",
            Self::ZeroWeight => "zero_weight",
            Self::UndecodableRule => "undecodable_rule",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleIssue {
    pub kind: IssueKind,
    pub severity: Severity,
    /// `None` for built-in patterns and unreadable rows
    pub org_id: Option<String>,
    pub rule_ids: Vec<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SeverityCounts {
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

impl SeverityCounts {
    fn add(&mut self, severity: Severity) {
        match severity {
            Severity::Critical => self.critical += 1,
            Severity::High => self.high += 1,
            Severity::Medium => self.medium += 1,
            Severity::Low => self.low += 1,
        }
    }
}

/// Structured validation report
#[derive(Debug, Clone, Serialize)]
pub struct RuleReport {
    pub generated_at: DateTime<Utc>,
    pub scope: String,
    pub rules_analyzed: usize,
    pub organizations: usize,
    pub counts: SeverityCounts,
    pub issues: Vec<RuleIssue>,
}

impl RuleReport {
    pub fn has_critical(&self) -> bool {
        self.counts.critical > 0
    }

    /// Process exit code for a completed validation
    pub fn exit_code(&self) -> u8 {
        if self.has_critical() {
            EXIT_CRITICAL
        } else {
            0
        }
    }

    pub fn issues_of(&self, kind: IssueKind) -> impl Iterator<Item = &RuleIssue> {
        self.issues.iter().filter(move |i| i.kind == kind)
    }

    /// Human-readable summary
    pub fn summary(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("Rule validation report ({})\n", self.scope));
        out.push_str(&format!("Generated: {}\n", self.generated_at.to_rfc3339()));
        out.push_str(&format!(
            "Rules analyzed: {} across {} organization(s)\n",
            self.rules_analyzed, self.organizations
        ));
        out.push_str(&format!(
            "Issues: critical={} high={} medium={} low={}\n",
            self.counts.critical, self.counts.high, self.counts.medium, self.counts.low
        ));

        if !self.issues.is_empty() {
            out.push('\n');
        }
        for issue in &self.issues {
            let location = match (&issue.org_id, issue.kind) {
                (Some(org), _) => format!("org {}", org),
                (None, IssueKind::UndecodableRule) => "unknown org".to_string(),
                (None, _) => "built-in".to_string(),
            };
            out.push_str(&format!(
                "[{}] {} ({}; {}): {}\n",
                issue.severity.as_str().to_uppercase(),
                issue.kind.as_str(),
                location,
                issue.rule_ids.join(", "),
                issue.message
            ));
        }

        out.push('\n');
        if self.has_critical() {
            out.push_str("Result: FAIL (critical issues found)\n");
        } else {
            out.push_str("Result: PASS\n");
        }
        out
    }
}

/// How much two rule patterns overlap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Overlap {
    /// Same normalized vendor
    SameVendor,
    /// One vendor contains the other
    VendorContainment,
    /// Only one side constrains the vendor
    VendorWildcard,
    /// Neither constrains the vendor; MCC and/or tokens only
    NoVendor,
}

impl Overlap {
    fn severity(self) -> Severity {
        match self {
            Self::SameVendor => Severity::Critical,
            Self::VendorContainment => Severity::High,
            Self::VendorWildcard => Severity::Medium,
            Self::NoVendor => Severity::Low,
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Self::SameVendor => "identical vendor",
            Self::VendorContainment => "overlapping vendor names",
            Self::VendorWildcard => "one rule matches any vendor",
            Self::NoVendor => "no vendor constraint on either rule",
        }
    }
}

/// Normalized view of a rule used for pairwise comparison
struct RuleView<'a> {
    index: usize,
    rule: &'a VendorRule,
    vendor: Option<String>,
    mcc: Option<String>,
    literal_tokens: BTreeSet<String>,
    usable: bool,
}

impl<'a> RuleView<'a> {
    fn new(index: usize, rule: &'a VendorRule) -> Self {
        let compiled = CompiledRule::compile(rule.clone());
        let literal_tokens = rule
            .pattern
            .description_tokens
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .map(|t| match t.strip_prefix(REGEX_TOKEN_PREFIX) {
                Some(_) => t.to_string(),
                None => t.to_lowercase(),
            })
            .collect();
        Self {
            index,
            rule,
            vendor: compiled.vendor,
            mcc: compiled.mcc,
            literal_tokens,
            usable: compiled.defect.is_none(),
        }
    }

    fn id(&self) -> String {
        self.rule.id.to_string()
    }

    /// True when this rule is evaluated ahead of `other`
    fn outranks(&self, other: &RuleView<'_>) -> bool {
        self.rule.weight > other.rule.weight
            || (self.rule.weight == other.rule.weight && self.index < other.index)
    }

    /// Every transaction matching `other` also matches `self`
    fn covers(&self, other: &RuleView<'_>) -> bool {
        let vendor_ok = match (&self.vendor, &other.vendor) {
            (None, _) => true,
            (Some(a), Some(b)) => a == b,
            (Some(_), None) => false,
        };
        let mcc_ok = match (&self.mcc, &other.mcc) {
            (None, _) => true,
            (Some(a), Some(b)) => a == b,
            (Some(_), None) => false,
        };
        vendor_ok && mcc_ok && self.literal_tokens.is_subset(&other.literal_tokens)
    }
}

fn overlap(a: &RuleView<'_>, b: &RuleView<'_>) -> Option<Overlap> {
    if let (Some(x), Some(y)) = (&a.mcc, &b.mcc) {
        if x != y {
            return None;
        }
    }
    match (&a.vendor, &b.vendor) {
        (Some(x), Some(y)) if x == y => Some(Overlap::SameVendor),
        (Some(x), Some(y)) if x.contains(y.as_str()) || y.contains(x.as_str()) => Some(Overlap::VendorContainment),
        (Some(_), Some(_)) => None,
        (None, None) => Some(Overlap::NoVendor),
        _ => Some(Overlap::VendorWildcard),
    }
}

/// Static analyzer over a rule set
pub struct RuleValidator<'t> {
    taxonomy: &'t Taxonomy,
    check_builtin_patterns: bool,
}

impl<'t> RuleValidator<'t> {
    pub fn new(taxonomy: &'t Taxonomy) -> Self {
        Self {
            taxonomy,
            check_builtin_patterns: true,
        }
    }

    pub fn without_builtin_patterns(mut self) -> Self {
        self.check_builtin_patterns = false;
        self
    }

    /// Analyze `rules` (any mix of organizations)
    ///
    /// # Arguments
    /// * `rules` - Rule set in stored order
    /// * `scope` - Label for the report header
    ///
    /// # Returns
    /// RuleReport with issues ordered by severity
    pub fn analyze(&self, rules: &[VendorRule], scope: &str) -> RuleReport {
        self.analyze_rows(rules, &[], scope)
    }

    /// Analyze a stored listing; every undecodable row is a critical issue
    pub fn analyze_listing(&self, listing: &RuleListing, scope: &str) -> RuleReport {
        self.analyze_rows(&listing.rules, &listing.undecodable, scope)
    }

    fn analyze_rows(&self, rules: &[VendorRule], undecodable: &[UndecodableRule], scope: &str) -> RuleReport {
        let mut issues: Vec<RuleIssue> = undecodable
            .iter()
            .map(|row| RuleIssue {
                kind: IssueKind::UndecodableRule,
                severity: Severity::Critical,
                org_id: row.org_id.clone(),
                rule_ids: vec![row.rule_id.clone()],
                message: format!("stored rule cannot be read: {}", row.reason),
            })
            .collect();

        let mut by_org: BTreeMap<&str, Vec<RuleView<'_>>> = BTreeMap::new();
        for (index, rule) in rules.iter().enumerate() {
            by_org
                .entry(rule.org_id.as_str())
                .or_default()
                .push(RuleView::new(index, rule));
        }
        let organizations: BTreeSet<&str> = by_org
            .keys()
            .copied()
            .chain(undecodable.iter().filter_map(|row| row.org_id.as_deref()))
            .collect();

        for (org_id, views) in &by_org {
            for view in views {
                self.check_integrity(org_id, view, &mut issues);
            }
            self.check_pairs(org_id, views, &mut issues);
        }

        if self.check_builtin_patterns {
            for (idx, (expr, slug)) in DESCRIPTION_PATTERNS.iter().enumerate() {
                for problem in check_expression(expr) {
                    issues.push(RuleIssue {
                        kind: IssueKind::UnsafeRegex,
                        severity: regex_severity(&problem),
                        org_id: None,
                        rule_ids: vec![format!("builtin:{}", idx)],
                        message: format!("pattern for {} {}", slug, problem.describe()),
                    });
                }
            }
        }

        issues.sort_by(|a, b| a.severity.cmp(&b.severity));
        let mut counts = SeverityCounts::default();
        for issue in &issues {
            counts.add(issue.severity);
        }

        let rules_analyzed = rules.len() + undecodable.len();
        tracing::info!(
            scope = %scope,
            rules = rules_analyzed,
            undecodable = undecodable.len(),
            critical = counts.critical,
            high = counts.high,
            medium = counts.medium,
            low = counts.low,
            "Rule validation complete"
        );

        RuleReport {
            generated_at: Utc::now(),
            scope: scope.to_string(),
            rules_analyzed,
            organizations: organizations.len(),
            counts,
            issues,
        }
    }

    fn check_integrity(&self, org_id: &str, view: &RuleView<'_>, issues: &mut Vec<RuleIssue>) {
        let rule = view.rule;
        let mut push = |kind, severity, message: String| {
            issues.push(RuleIssue {
                kind,
                severity,
                org_id: Some(org_id.to_string()),
                rule_ids: vec![view.id()],
                message,
            })
        };

        if self.taxonomy.get_by_id(rule.category_id).is_none() {
            push(
                IssueKind::UnknownCategory,
                Severity::Critical,
                format!("category {} is not in the taxonomy", rule.category_id),
            );
        }
        if rule.pattern.is_empty() {
            push(
                IssueKind::EmptyPattern,
                Severity::Critical,
                "pattern constrains nothing and would match every transaction".to_string(),
            );
        }
        if rule.weight == 0 {
            push(IssueKind::ZeroWeight, Severity::High, "weight is zero".to_string());
        }
        for token in &rule.pattern.description_tokens {
            let Some(expr) = token.trim().strip_prefix(REGEX_TOKEN_PREFIX) else {
                continue;
            };
            for problem in check_expression(expr) {
                push(
                    IssueKind::UnsafeRegex,
                    regex_severity(&problem),
                    format!("expression {:?} {}", expr, problem.describe()),
                );
            }
        }
    }

    fn check_pairs(&self, org_id: &str, views: &[RuleView<'_>], issues: &mut Vec<RuleIssue>) {
        for (i, a) in views.iter().enumerate() {
            for b in &views[i + 1..] {
                if !a.usable || !b.usable {
                    continue;
                }

                if a.rule.category_id != b.rule.category_id {
                    if let Some(kind) = overlap(a, b) {
                        issues.push(RuleIssue {
                            kind: IssueKind::Conflict,
                            severity: kind.severity(),
                            org_id: Some(org_id.to_string()),
                            rule_ids: vec![a.id(), b.id()],
                            message: format!(
                                "rules map to different categories ({} vs {}) with {}",
                                self.slug_of(a.rule),
                                self.slug_of(b.rule),
                                kind.describe()
                            ),
                        });
                    }
                }

                let (winner, loser) = if a.outranks(b) { (a, b) } else { (b, a) };
                if winner.covers(loser) {
                    let same_category = winner.rule.category_id == loser.rule.category_id;
                    issues.push(RuleIssue {
                        kind: IssueKind::DeadRule,
                        severity: if same_category { Severity::Low } else { Severity::High },
                        org_id: Some(org_id.to_string()),
                        rule_ids: vec![loser.id(), winner.id()],
                        message: format!(
                            "rule {} never fires: rule {} (weight {}) matches everything it matches{}",
                            loser.id(),
                            winner.id(),
                            winner.rule.weight,
                            if same_category { " with the same category" } else { "" }
                        ),
                    });
                }
            }
        }
    }

    fn slug_of(&self, rule: &VendorRule) -> String {
        self.taxonomy
            .get_by_id(rule.category_id)
            .map_or_else(|| rule.category_id.to_string(), |n| n.slug.to_string())
    }
}

fn regex_severity(issue: &RegexIssue) -> Severity {
    match issue {
        RegexIssue::Invalid(_) => Severity::Critical,
        RegexIssue::MatchesEmpty => Severity::High,
        RegexIssue::NestedQuantifier => Severity::Medium,
    }
}

/// Analyze with the standard taxonomy and built-in pattern checks
pub fn analyze(rules: &[VendorRule], taxonomy: &Taxonomy, scope: &str) -> RuleReport {
    RuleValidator::new(taxonomy).analyze(rules, scope)
}

/// [`analyze`] over a stored listing, including its undecodable rows
pub fn analyze_listing(listing: &RuleListing, taxonomy: &Taxonomy, scope: &str) -> RuleReport {
    RuleValidator::new(taxonomy).analyze_listing(listing, scope)
}
