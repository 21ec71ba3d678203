//! Configuration resolution for tally-ce
//!
//! LLM API key priority: ENV → TOML. A missing key is not an error; Pass-2
//! then degrades to the safe fallback.
//!
//! Log filter priority: `RUST_LOG` → `[logging] level`.

use tally_common::config::TomlConfig;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Environment variable holding the LLM API key
pub const LLM_API_KEY_ENV: &str = "TALLY_LLM_API_KEY";

/// Resolve the LLM API key
pub fn resolve_llm_api_key(toml_config: &TomlConfig) -> Option<String> {
    resolve_key(
        std::env::var(LLM_API_KEY_ENV).ok(),
        toml_config.llm.api_key.as_deref(),
    )
}

fn resolve_key(env_key: Option<String>, toml_key: Option<&str>) -> Option<String> {
    let env_key = env_key.filter(|k| is_valid_key(k));
    let toml_key = toml_key.filter(|k| is_valid_key(k));

    if env_key.is_some() && toml_key.is_some() {
        warn!("LLM API key found in environment and TOML. Using environment (highest priority).");
    }

    if let Some(key) = env_key {
        info!("LLM API key loaded from environment variable");
        return Some(key.trim().to_string());
    }
    if let Some(key) = toml_key {
        info!("LLM API key loaded from TOML config");
        return Some(key.trim().to_string());
    }

    warn!(
        "LLM API key not configured (set {} or [llm] api_key); Pass-2 will use the fallback category",
        LLM_API_KEY_ENV
    );
    None
}

/// Validate key (non-empty, non-whitespace)
pub fn is_valid_key(key: &str) -> bool {
    !key.trim().is_empty()
}

/// Log filter for the binaries
pub fn log_filter(toml_config: &TomlConfig) -> EnvFilter {
    EnvFilter::new(log_directive(
        std::env::var(EnvFilter::DEFAULT_ENV).ok(),
        &toml_config.logging.level,
    ))
}

fn log_directive(rust_log: Option<String>, configured: &str) -> String {
    match rust_log.filter(|d| !d.trim().is_empty()) {
        Some(directive) => directive,
        None => configured.to_string(),
    }
}
