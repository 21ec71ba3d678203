//! Configuration loading and config-file resolution
//!
//! Bootstrap configuration comes from a single TOML file. Every field has a
//! built-in default so a missing file (or a missing section) still yields a
//! runnable configuration.
//!
//! # Settings Sources Priority
//!
//! 1. Command-line argument (`--config`)
//! 2. Environment variable (`TALLY_CONFIG`)
//! 3. User config file (`~/.config/tally/tally.toml`)
//! 4. Built-in defaults (code constants)

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "TALLY_CONFIG";

/// Bootstrap configuration loaded from TOML file
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TomlConfig {
    /// Path to SQLite database file (defaults to the data directory)
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    /// Logging configuration (optional)
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Generative model provider settings
    #[serde(default)]
    pub llm: LlmConfig,

    /// Categorization thresholds and tuning
    #[serde(default)]
    pub engine: EngineConfig,

    /// Batch orchestration and concurrency ceilings
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Generative model provider configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmConfig {
    /// Chat-completions endpoint URL
    #[serde(default = "default_llm_endpoint")]
    pub endpoint: String,
    /// Model identifier sent with every request
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: u32,
    /// Total request timeout in seconds
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    /// Client-side request pacing
    #[serde(default = "default_llm_rps")]
    pub requests_per_second: u32,
    /// API key (environment variable takes precedence)
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: default_llm_endpoint(),
            model: default_llm_model(),
            temperature: 0.0,
            max_tokens: default_llm_max_tokens(),
            timeout_secs: default_llm_timeout_secs(),
            requests_per_second: default_llm_rps(),
            api_key: None,
        }
    }
}

/// Categorization thresholds
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Industry tag included in the model prompt
    #[serde(default = "default_industry")]
    pub industry: String,
    /// Pass-1 confidence below which Pass-2 runs (first-pass ingestion)
    #[serde(default = "default_pass2_threshold")]
    pub pass2_threshold: f64,
    /// Pass-1 confidence below which Pass-2 runs (historical re-categorization)
    #[serde(default = "default_recat_pass2_threshold")]
    pub recategorization_pass2_threshold: f64,
    /// Final confidence at or above which a category is applied without review
    #[serde(default = "default_auto_apply_threshold")]
    pub auto_apply_threshold: f64,
    #[serde(default = "default_recat_auto_apply_threshold")]
    pub recategorization_auto_apply_threshold: f64,
    /// Flat confidence boost for similar-vendor evidence
    #[serde(default = "default_embedding_boost")]
    pub embedding_boost: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            industry: default_industry(),
            pass2_threshold: default_pass2_threshold(),
            recategorization_pass2_threshold: default_recat_pass2_threshold(),
            auto_apply_threshold: default_auto_apply_threshold(),
            recategorization_auto_apply_threshold: default_recat_auto_apply_threshold(),
            embedding_boost: default_embedding_boost(),
        }
    }
}

/// Batch orchestration configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OrchestratorConfig {
    /// Transactions pulled per batch step
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_org_concurrency")]
    pub org_concurrency_limit: usize,
    #[serde(default = "default_global_concurrency")]
    pub global_concurrency_limit: usize,
    /// Batch steps a single worker run may spend on one organization
    #[serde(default = "default_max_calls_per_org")]
    pub max_calls_per_org: u32,
    /// Hard ceiling on any rate-limit sleep
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Suggested wait when the local limiter refuses admission
    #[serde(default = "default_admission_backoff_ms")]
    pub admission_backoff_ms: u64,
    /// HTTP trigger port
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            org_concurrency_limit: default_org_concurrency(),
            global_concurrency_limit: default_global_concurrency(),
            max_calls_per_org: default_max_calls_per_org(),
            max_backoff_ms: default_max_backoff_ms(),
            admission_backoff_ms: default_admission_backoff_ms(),
            port: default_port(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_llm_endpoint() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_llm_max_tokens() -> u32 {
    200
}

fn default_llm_timeout_secs() -> u64 {
    20
}

fn default_llm_rps() -> u32 {
    2
}

fn default_industry() -> String {
    "salon".to_string()
}

fn default_pass2_threshold() -> f64 {
    0.80
}

fn default_recat_pass2_threshold() -> f64 {
    0.90
}

fn default_auto_apply_threshold() -> f64 {
    0.85
}

fn default_recat_auto_apply_threshold() -> f64 {
    0.90
}

fn default_embedding_boost() -> f64 {
    0.05
}

fn default_page_size() -> u32 {
    50
}

fn default_org_concurrency() -> usize {
    1
}

fn default_global_concurrency() -> usize {
    4
}

fn default_max_calls_per_org() -> u32 {
    20
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_admission_backoff_ms() -> u64 {
    1_000
}

fn default_port() -> u16 {
    5780
}

/// Resolve the config file path
///
/// Returns `None` when no source names an existing file; callers then fall
/// back to `TomlConfig::default()`.
pub fn resolve_config_path(cli_arg: Option<&Path>) -> Option<PathBuf> {
    // Priority 1: Command-line argument (returned even if missing so the load reports it)
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    // Priority 3: User config directory
    dirs::config_dir()
        .map(|d| d.join("tally").join("tally.toml"))
        .filter(|p| p.exists())
}

/// Load TOML config from an explicit path
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))
}

/// Load configuration following the resolution priority
pub fn load_config(cli_arg: Option<&Path>) -> Result<TomlConfig> {
    match resolve_config_path(cli_arg) {
        Some(path) => {
            let config = load_toml_config(&path)?;
            tracing::info!("Configuration loaded from {}", path.display());
            Ok(config)
        }
        None => {
            tracing::info!("No config file found, using built-in defaults");
            Ok(TomlConfig::default())
        }
    }
}

impl TomlConfig {
    /// Database path, defaulting to the platform data directory
    pub fn database_path(&self) -> PathBuf {
        self.database_path.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .map(|d| d.join("tally").join("tally.db"))
                .unwrap_or_else(|| PathBuf::from("./tally_data/tally.db"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_when_sections_missing() {
        let config: TomlConfig = toml::from_str("").unwrap();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.engine.pass2_threshold, 0.80);
        assert!(config.engine.recategorization_pass2_threshold > config.engine.pass2_threshold);
        assert_eq!(config.orchestrator.page_size, 50);
        assert!(config.llm.api_key.is_none());
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config: TomlConfig = toml::from_str(
            r#"
            [orchestrator]
            global_concurrency_limit = 8

            [engine]
            industry = "barbershop"
            "#,
        )
        .unwrap();
        assert_eq!(config.orchestrator.global_concurrency_limit, 8);
        assert_eq!(config.orchestrator.org_concurrency_limit, 1);
        assert_eq!(config.engine.industry, "barbershop");
        assert_eq!(config.engine.auto_apply_threshold, 0.85);
    }

    #[test]
    fn test_load_from_explicit_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tally.toml");
        std::fs::write(&path, "database_path = \"/tmp/x.db\"\n[llm]\nmodel = \"m1\"\n").unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.llm.model, "m1");
        assert_eq!(config.database_path(), PathBuf::from("/tmp/x.db"));
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[engine\n").unwrap();

        match load_toml_config(&path) {
            Err(Error::Config(msg)) => assert!(msg.contains("Parse")),
            other => panic!("expected config error, got {:?}", other),
        }
    }
}
