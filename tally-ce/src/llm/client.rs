//! Generative model provider
//!
//! `HttpLlmProvider` speaks the OpenAI-compatible chat-completions format.
//! Requests are paced client-side with a token bucket; upstream 429s are
//! surfaced as [`LlmError::RateLimited`] so the orchestrator can back off.

use crate::error::LlmError;
use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::time::Duration;
use tally_common::config::LlmConfig;

/// Rendered prompt plus generation settings
#[derive(Debug, Clone, PartialEq)]
pub struct LlmRequest {
    pub prompt: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Text-completion provider
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Identifier recorded as `decided_by` on audit decisions
    fn model(&self) -> &str;

    /// False when every call is bound to fail (missing credentials)
    fn is_configured(&self) -> bool {
        true
    }

    /// Return the raw model text for a prompt
    async fn complete(&self, request: &LlmRequest) -> Result<String, LlmError>;
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    max_tokens: u32,
    messages: [ChatMessage<'a>; 1],
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// HTTP chat-completions provider
pub struct HttpLlmProvider {
    http_client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    rate_limiter: DefaultDirectRateLimiter,
}

impl HttpLlmProvider {
    /// Build a provider; a missing API key yields `NotConfigured` on every call
    pub fn new(config: &LlmConfig, api_key: Option<String>) -> Result<Self, LlmError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| LlmError::Network(format!("Failed to build HTTP client: {}", e)))?;

        let per_second = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);

        Ok(Self {
            http_client,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            rate_limiter: RateLimiter::direct(Quota::per_second(per_second)),
        })
    }
}

/// Parse a `Retry-After` value given in seconds
pub fn parse_retry_after(value: Option<&str>) -> Option<u64> {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(|secs| secs.saturating_mul(1000))
}

#[async_trait]
impl LlmProvider for HttpLlmProvider {
    fn model(&self) -> &str {
        &self.model
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    async fn complete(&self, request: &LlmRequest) -> Result<String, LlmError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| LlmError::NotConfigured("LLM API key not set".to_string()))?;

        // Wait for a token (client-side pacing)
        self.rate_limiter.until_ready().await;

        tracing::debug!(
            model = %request.model,
            prompt_chars = request.prompt.len(),
            "Sending categorization prompt"
        );

        let body = ChatRequest {
            model: &request.model,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            messages: [ChatMessage {
                role: "user",
                content: &request.prompt,
            }],
        };

        let response = self
            .http_client
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Network(format!("LLM request failed: {}", e)))?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after_ms = parse_retry_after(
                response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok()),
            );
            return Err(LlmError::RateLimited { retry_after_ms });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Parse(format!("Failed to parse LLM response envelope: {}", e)))?;

        chat.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LlmError::Parse("LLM response had no content".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after(Some("3")), Some(3000));
        assert_eq!(parse_retry_after(Some(" 0 ")), Some(0));
        assert_eq!(parse_retry_after(Some("Wed, 21 Oct 2015 07:28:00 GMT")), None);
        assert_eq!(parse_retry_after(None), None);
    }

    #[tokio::test]
    async fn test_missing_key_is_not_configured() {
        let provider = HttpLlmProvider::new(&LlmConfig::default(), Some("   ".into())).unwrap();
        assert!(!provider.is_configured());
        let request = LlmRequest {
            prompt: "p".into(),
            model: "m".into(),
            temperature: 0.0,
            max_tokens: 10,
        };
        assert!(matches!(provider.complete(&request).await, Err(LlmError::NotConfigured(_))));
    }

    #[test]
    fn test_chat_request_shape() {
        let body = ChatRequest {
            model: "m",
            temperature: 0.0,
            max_tokens: 50,
            messages: [ChatMessage { role: "user", content: "hi" }],
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["max_tokens"], 50);
    }
}
