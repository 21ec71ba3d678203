//! Parsing of untrusted model output
//!
//! The model may wrap its JSON in prose or code fences. Candidates are tried
//! in order: the whole text, a fenced block, then the first balanced
//! `{...}` span. Parsing never panics and never returns an error type; a
//! failure is a value carrying its reason.

use crate::types::clamp_confidence;
use serde_json::{Map, Value};

/// Confidence assumed when the model omits one
pub const DEFAULT_MODEL_CONFIDENCE: f64 = 0.5;

/// Typed model verdict
#[derive(Debug, Clone, PartialEq)]
pub struct LlmVerdict {
    pub category_slug: String,
    /// Clamped to `[0, 1]`
    pub confidence: f64,
    pub rationale: Option<String>,
}

/// Outcome of parsing a model response
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedResponse {
    Parsed(LlmVerdict),
    Failed(String),
}

/// Parse raw model text into a verdict
pub fn parse_response(raw: &str) -> ParsedResponse {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return ParsedResponse::Failed("empty response".to_string());
    }

    let candidates = [
        Some(trimmed),
        extract_fenced_block(trimmed),
        extract_balanced_object(trimmed),
    ];

    let mut last_reason = "no JSON object found".to_string();
    for candidate in candidates.into_iter().flatten() {
        match serde_json::from_str::<Value>(candidate) {
            Ok(Value::Object(obj)) => match verdict_from_object(&obj) {
                Ok(verdict) => return ParsedResponse::Parsed(verdict),
                Err(reason) => last_reason = reason,
            },
            Ok(_) => last_reason = "JSON is not an object".to_string(),
            Err(e) => last_reason = format!("invalid JSON: {}", e),
        }
    }
    ParsedResponse::Failed(last_reason)
}

fn verdict_from_object(obj: &Map<String, Value>) -> Result<LlmVerdict, String> {
    let slug = obj
        .get("category_slug")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| "missing category_slug".to_string())?;

    let confidence = match obj.get("confidence") {
        None | Some(Value::Null) => DEFAULT_MODEL_CONFIDENCE,
        Some(Value::Number(n)) => n.as_f64().unwrap_or(DEFAULT_MODEL_CONFIDENCE),
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| format!("non-numeric confidence {:?}", s))?,
        Some(other) => return Err(format!("unexpected confidence {}", other)),
    };

    let rationale = obj
        .get("rationale")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    Ok(LlmVerdict {
        category_slug: slug.to_string(),
        confidence: clamp_confidence(confidence, 0.0, 1.0),
        rationale,
    })
}

/// Contents of the first ``` fenced block (language tag skipped)
pub fn extract_fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after_open = &text[start + 3..];
    // Skip an optional language tag on the opening line
    let body_start = after_open.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after_open[body_start..];
    let end = body.find("```")?;
    let block = body[..end].trim();
    (!block.is_empty()).then_some(block)
}

/// First `{...}` span whose braces balance, ignoring braces inside strings
pub fn extract_balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parsed(raw: &str) -> LlmVerdict {
        match parse_response(raw) {
            ParsedResponse::Parsed(v) => v,
            ParsedResponse::Failed(reason) => panic!("failed to parse {:?}: {}", raw, reason),
        }
    }

    #[test]
    fn test_direct_json() {
        let v = parsed(r#"{"category_slug":"rent","confidence":0.82,"rationale":"landlord"}"#);
        assert_eq!(v.category_slug, "rent");
        assert_eq!(v.confidence, 0.82);
        assert_eq!(v.rationale.as_deref(), Some("landlord"));
    }

    #[test]
    fn test_fenced_json() {
        let raw = "Here you go:\n```json\n{\"category_slug\": \"utilities\", \"confidence\": 0.7}\n```\nThanks";
        assert_eq!(parsed(raw).category_slug, "utilities");
    }

    #[test]
    fn test_json_inside_prose() {
        let raw = "I think {\"category_slug\": \"marketing\", \"confidence\": 0.66, \"rationale\": \"ads {boost}\"} is right. {ignored}";
        let v = parsed(raw);
        assert_eq!(v.category_slug, "marketing");
        assert_eq!(v.rationale.as_deref(), Some("ads {boost}"));
    }

    #[test]
    fn test_confidence_clamped_and_defaulted() {
        assert_eq!(parsed(r#"{"category_slug":"rent","confidence":7}"#).confidence, 1.0);
        assert_eq!(parsed(r#"{"category_slug":"rent","confidence":-3}"#).confidence, 0.0);
        assert_eq!(parsed(r#"{"category_slug":"rent"}"#).confidence, DEFAULT_MODEL_CONFIDENCE);
        assert_eq!(parsed(r#"{"category_slug":"rent","confidence":"0.9"}"#).confidence, 0.9);
        assert_eq!(parsed(r#"{"category_slug":"rent","confidence":"NaN"}"#).confidence, 0.0);
    }

    #[test]
    fn test_failures_are_values() {
        for raw in [
            "",
            "no json here",
            "{\"category_slug\": ",
            "[1,2,3]",
            r#"{"confidence": 0.9}"#,
            r#"{"category_slug": "  "}"#,
            r#"{"category_slug":"rent","confidence":"high"}"#,
            "```\n```",
        ] {
            assert!(matches!(parse_response(raw), ParsedResponse::Failed(_)), "{:?}", raw);
        }
    }

    #[test]
    fn test_balanced_extraction_handles_escapes() {
        let text = r#"x {"a": "quote \" and } brace", "b": {"c": 1}} y"#;
        assert_eq!(
            extract_balanced_object(text),
            Some(r#"{"a": "quote \" and } brace", "b": {"c": 1}}"#)
        );
        assert_eq!(extract_balanced_object("{ unclosed"), None);
    }
}
