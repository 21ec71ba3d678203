//! Pass-2 LLM Classifier
//!
//! Builds a bounded prompt, calls the provider, parses the untrusted reply
//! and maps the slug through the taxonomy's total slug-to-id function.
//! Transport and parse failures both become the safe fallback (other
//! operating expenses at confidence 0.5); nothing propagates to the caller.

pub mod client;
pub mod parser;
pub mod prompt;
pub mod reporter;

pub use client::{HttpLlmProvider, LlmProvider, LlmRequest};
pub use reporter::{ErrorReporter, TracingErrorReporter};

use crate::error::LlmError;
use crate::taxonomy::{slugs, taxonomy, Taxonomy};
use crate::types::CategorizationResult;
use parser::{parse_response, ParsedResponse};
use std::sync::Arc;
use tally_common::config::LlmConfig;
use tally_common::models::NormalizedTransaction;

/// Confidence assigned to the safe fallback
pub const FALLBACK_CONFIDENCE: f64 = 0.5;

/// Pass-2 output plus upstream back-pressure signal
#[derive(Debug, Clone, PartialEq)]
pub struct LlmOutcome {
    pub result: CategorizationResult,
    /// Provider answered 429
    pub rate_limited: bool,
    pub retry_after_ms: Option<u64>,
}

/// Model-backed classifier
pub struct LlmClassifier {
    provider: Arc<dyn LlmProvider>,
    reporter: Arc<dyn ErrorReporter>,
    taxonomy: &'static Taxonomy,
    temperature: f32,
    max_tokens: u32,
    industry: String,
}

impl LlmClassifier {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        reporter: Arc<dyn ErrorReporter>,
        config: &LlmConfig,
        industry: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            reporter,
            taxonomy: taxonomy(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            industry: industry.into(),
        }
    }

    /// Identifier recorded on audit decisions
    pub fn decided_by(&self) -> String {
        format!("llm:{}", self.provider.model())
    }

    /// Whether Pass-2 can reach a model at all
    pub fn is_configured(&self) -> bool {
        self.provider.is_configured()
    }

    /// Categorize one transaction; never fails
    pub async fn classify(&self, tx: &NormalizedTransaction) -> LlmOutcome {
        let request = LlmRequest {
            prompt: prompt::build_prompt(tx, self.taxonomy, &self.industry),
            model: self.provider.model().to_string(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let raw = match self.provider.complete(&request).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(tx_id = %tx.id, org_id = %tx.org_id, error = %e, "LLM call failed, using fallback");
                self.reporter
                    .report("llm_categorization", &format!("tx {}: {}", tx.id, e));
                let (rate_limited, retry_after_ms) = match e {
                    LlmError::RateLimited { retry_after_ms } => (true, retry_after_ms),
                    _ => (false, None),
                };
                return LlmOutcome {
                    result: self.fallback(format!("llm fallback: request failed ({})", e)),
                    rate_limited,
                    retry_after_ms,
                };
            }
        };

        let result = match parse_response(&raw) {
            ParsedResponse::Parsed(verdict) => {
                let mut rationale = Vec::new();
                let category_id = self.taxonomy.map_slug_to_id(&verdict.category_slug);
                match self.taxonomy.resolve_slug(&verdict.category_slug) {
                    Some(node) => rationale.push(format!("llm chose {} ({:.2})", node.slug, verdict.confidence)),
                    None => rationale.push(format!(
                        "llm returned unknown slug {:?}, mapped to {}",
                        verdict.category_slug,
                        slugs::OTHER_EXPENSES
                    )),
                }
                if let Some(reason) = verdict.rationale {
                    rationale.push(reason);
                }
                CategorizationResult {
                    category_id: Some(category_id),
                    confidence: Some(verdict.confidence),
                    rationale,
                }
            }
            ParsedResponse::Failed(reason) => {
                tracing::warn!(tx_id = %tx.id, reason = %reason, "Unparseable LLM response, using fallback");
                self.fallback(format!("llm fallback: parse failure ({})", reason))
            }
        };

        LlmOutcome {
            result,
            rate_limited: false,
            retry_after_ms: None,
        }
    }

    fn fallback(&self, reason: String) -> CategorizationResult {
        CategorizationResult {
            category_id: Some(self.taxonomy.map_slug_to_id(slugs::OTHER_EXPENSES)),
            confidence: Some(FALLBACK_CONFIDENCE),
            rationale: vec![reason],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taxonomy::OTHER_EXPENSES_ID;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::sync::Mutex;
    use tally_common::models::TransactionSource;

    struct Scripted {
        reply: Result<String, fn() -> LlmError>,
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LlmProvider for Scripted {
        fn model(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, request: &LlmRequest) -> Result<String, LlmError> {
            self.prompts.lock().unwrap().push(request.prompt.clone());
            match &self.reply {
                Ok(s) => Ok(s.clone()),
                Err(make) => Err(make()),
            }
        }
    }

    #[derive(Default)]
    struct Recording(Mutex<Vec<String>>);

    impl ErrorReporter for Recording {
        fn report(&self, _context: &str, message: &str) {
            self.0.lock().unwrap().push(message.to_string());
        }
    }

    fn tx() -> NormalizedTransaction {
        NormalizedTransaction {
            id: "tx-9".into(),
            org_id: "org".into(),
            date: NaiveDate::from_ymd_opt(2024, 5, 5).unwrap(),
            amount_cents: -9_900,
            currency: "USD".into(),
            description: "PMT TO SOMEONE".into(),
            merchant_name: None,
            mcc: None,
            prior_category_id: None,
            prior_confidence: None,
            source: TransactionSource::BankFeed,
        }
    }

    fn classifier(reply: Result<String, fn() -> LlmError>) -> (LlmClassifier, Arc<Recording>) {
        let reporter = Arc::new(Recording::default());
        let provider = Arc::new(Scripted {
            reply,
            prompts: Mutex::new(Vec::new()),
        });
        (
            LlmClassifier::new(provider, reporter.clone(), &LlmConfig::default(), "salon"),
            reporter,
        )
    }

    #[tokio::test]
    async fn test_valid_reply_maps_slug() {
        let (c, _) = classifier(Ok("```json\n{\"category_slug\":\"insurance\",\"confidence\":0.77,\"rationale\":\"policy\"}\n```".into()));
        let outcome = c.classify(&tx()).await;
        assert_eq!(outcome.result.category_id, taxonomy().get_by_slug("insurance").map(|n| n.id));
        assert_eq!(outcome.result.confidence, Some(0.77));
        assert!(!outcome.rate_limited);
        assert_eq!(outcome.result.rationale[1], "policy");
    }

    #[tokio::test]
    async fn test_unknown_slug_maps_to_fallback_node() {
        let (c, _) = classifier(Ok(r#"{"category_slug":"crypto_gains","confidence":0.9}"#.into()));
        let outcome = c.classify(&tx()).await;
        assert_eq!(outcome.result.category_id, Some(OTHER_EXPENSES_ID));
        assert_eq!(outcome.result.confidence, Some(0.9));
    }

    #[tokio::test]
    async fn test_parse_failure_falls_back() {
        let (c, reporter) = classifier(Ok("I cannot help with that".into()));
        let outcome = c.classify(&tx()).await;
        assert_eq!(outcome.result.category_id, Some(OTHER_EXPENSES_ID));
        assert_eq!(outcome.result.confidence, Some(FALLBACK_CONFIDENCE));
        assert!(outcome.result.rationale[0].contains("parse failure"));
        assert!(reporter.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transport_error_falls_back_and_reports() {
        let (c, reporter) = classifier(Err(|| LlmError::Network("connection reset".into())));
        let outcome = c.classify(&tx()).await;
        assert_eq!(outcome.result.category_id, Some(OTHER_EXPENSES_ID));
        assert_eq!(outcome.result.confidence, Some(FALLBACK_CONFIDENCE));
        assert_eq!(reporter.0.lock().unwrap().len(), 1);
        assert!(!outcome.rate_limited);
    }

    #[tokio::test]
    async fn test_rate_limit_is_signalled() {
        let (c, _) = classifier(Err(|| LlmError::RateLimited { retry_after_ms: Some(2_000) }));
        let outcome = c.classify(&tx()).await;
        assert!(outcome.rate_limited);
        assert_eq!(outcome.retry_after_ms, Some(2_000));
        assert_eq!(outcome.result.confidence, Some(FALLBACK_CONFIDENCE));
    }
}
