//! Per-organization rule and embedding cache
//!
//! Populated once per organization per orchestrator run and then passed by
//! reference. The categorization path only reads it.

use super::normalize::{normalize_vendor, vendors_match};
use crate::store::CategorizationStore;
use regex::{Regex, RegexBuilder};
use tally_common::models::{VendorEmbedding, VendorRule};

/// Prefix marking a description token as a regular expression
pub const REGEX_TOKEN_PREFIX: &str = "re:";

/// One description condition of a rule
#[derive(Debug, Clone)]
pub enum TokenMatcher {
    /// Lowercased literal, matched by containment
    Literal(String),
    Regex(Regex),
}

impl TokenMatcher {
    pub fn matches(&self, description: &str, description_lower: &str) -> bool {
        match self {
            Self::Literal(token) => description_lower.contains(token.as_str()),
            Self::Regex(re) => re.is_match(description),
        }
    }
}

/// Compile a raw description token
pub fn compile_token(raw: &str) -> Result<Option<TokenMatcher>, regex::Error> {
    let token = raw.trim();
    if token.is_empty() {
        return Ok(None);
    }
    match token.strip_prefix(REGEX_TOKEN_PREFIX) {
        Some(expr) => RegexBuilder::new(expr)
            .case_insensitive(true)
            .build()
            .map(|re| Some(TokenMatcher::Regex(re))),
        None => Ok(Some(TokenMatcher::Literal(token.to_lowercase()))),
    }
}

/// A vendor rule with its match conditions pre-compiled
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub rule: VendorRule,
    pub vendor: Option<String>,
    pub mcc: Option<String>,
    pub tokens: Vec<TokenMatcher>,
    /// Why the rule cannot be evaluated safely
    pub defect: Option<String>,
}

impl CompiledRule {
    pub fn compile(rule: VendorRule) -> Self {
        let vendor = rule
            .pattern
            .vendor
            .as_deref()
            .map(normalize_vendor)
            .filter(|v| !v.is_empty());
        let mcc = rule
            .pattern
            .mcc
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string);

        let mut tokens = Vec::new();
        let mut defect = None;
        for raw in &rule.pattern.description_tokens {
            match compile_token(raw) {
                Ok(Some(matcher)) => tokens.push(matcher),
                Ok(None) => {}
                Err(e) => defect = Some(format!("invalid expression {:?}: {}", raw, e)),
            }
        }

        if defect.is_none() {
            if vendor.is_none() && mcc.is_none() && tokens.is_empty() {
                defect = Some("empty pattern".to_string());
            } else if rule.weight == 0 {
                defect = Some("zero weight".to_string());
            }
        }

        Self {
            rule,
            vendor,
            mcc,
            tokens,
            defect,
        }
    }
}

/// Cached rule and embedding data for one organization
#[derive(Debug, Clone, Default)]
pub struct OrgCache {
    pub org_id: String,
    pub rules: Vec<CompiledRule>,
    /// Normalized vendor names with stored embeddings
    pub embedding_vendors: Vec<String>,
    /// Store failures observed while loading (already degraded to empty)
    pub load_errors: Vec<String>,
}

impl OrgCache {
    /// Build a cache from already-fetched data
    pub fn from_parts(org_id: &str, rules: Vec<VendorRule>, embeddings: Vec<VendorEmbedding>) -> Self {
        let mut embedding_vendors: Vec<String> = embeddings
            .iter()
            .map(|e| normalize_vendor(&e.vendor))
            .filter(|v| !v.is_empty())
            .collect();
        embedding_vendors.sort();
        embedding_vendors.dedup();

        Self {
            org_id: org_id.to_string(),
            rules: rules.into_iter().map(CompiledRule::compile).collect(),
            embedding_vendors,
            load_errors: Vec::new(),
        }
    }

    /// Fetch rules and embeddings once; store failures degrade to "none found"
    pub async fn load(store: &dyn CategorizationStore, org_id: &str) -> Self {
        let mut load_errors = Vec::new();

        let rules = match store.list_vendor_rules(org_id).await {
            Ok(rules) => rules,
            Err(e) => {
                tracing::warn!(org_id = %org_id, error = %e, "Vendor rules unavailable, continuing without rules");
                load_errors.push(format!("vendor rules unavailable: {}", e));
                Vec::new()
            }
        };

        let embeddings = match store.list_vendor_embeddings(org_id).await {
            Ok(embeddings) => embeddings,
            Err(e) => {
                tracing::warn!(org_id = %org_id, error = %e, "Vendor embeddings unavailable, continuing without boost");
                load_errors.push(format!("vendor embeddings unavailable: {}", e));
                Vec::new()
            }
        };

        let mut cache = Self::from_parts(org_id, rules, embeddings);
        cache.load_errors = load_errors;

        tracing::debug!(
            org_id = %org_id,
            rules = cache.rules.len(),
            embedding_vendors = cache.embedding_vendors.len(),
            "Organization cache loaded"
        );
        cache
    }

    /// Similar-vendor evidence for a normalized merchant name
    pub fn has_similar_vendor(&self, merchant_norm: &str) -> bool {
        self.embedding_vendors
            .iter()
            .any(|v| vendors_match(v, merchant_norm))
    }
}
