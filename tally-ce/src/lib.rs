//! tally-ce: hybrid transaction categorization engine
//!
//! Deterministic rules (Pass-1) answer what they can; an LLM (Pass-2) fills
//! the gaps; guardrails veto financially wrong outcomes; the arbiter writes
//! the category and an audit decision; the orchestrator drains backlogs
//! under per-organization and global concurrency limits.

pub mod api;
pub mod arbiter;
pub mod config;
pub mod db;
pub mod error;
pub mod guardrails;
pub mod llm;
pub mod orchestrator;
pub mod pass1;
pub mod rule_validator;
pub mod store;
pub mod taxonomy;
pub mod types;

pub use crate::error::{ApiError, ApiResult};

use axum::Router;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tally_common::config::TomlConfig;
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;

use crate::arbiter::DecisionArbiter;
use crate::llm::{HttpLlmProvider, LlmClassifier, LlmProvider, TracingErrorReporter};
use crate::orchestrator::BatchOrchestrator;
use crate::pass1::Pass1Classifier;
use crate::store::{CategorizationStore, TransactionQueue};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<BatchOrchestrator>,
    pub startup_time: DateTime<Utc>,
    pub last_error: Arc<RwLock<Option<String>>>,
}

impl AppState {
    pub fn new(orchestrator: Arc<BatchOrchestrator>) -> Self {
        Self {
            orchestrator,
            startup_time: Utc::now(),
            last_error: Arc::new(RwLock::new(None)),
        }
    }
}

/// Build the HTTP router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::categorize_routes())
        .merge(api::health_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Assemble the engine from configuration and injected collaborators
///
/// # Arguments
/// * `config` - Loaded TOML configuration
/// * `provider` - Model provider for Pass-2
/// * `store` - Rule store and persistence
/// * `queue` - Backlog source
pub fn build_orchestrator(
    config: &TomlConfig,
    provider: Arc<dyn LlmProvider>,
    store: Arc<dyn CategorizationStore>,
    queue: Arc<dyn TransactionQueue>,
) -> BatchOrchestrator {
    let taxonomy = taxonomy::taxonomy();
    let pass1 = Pass1Classifier::standard(taxonomy, config.engine.embedding_boost);
    let llm = LlmClassifier::new(
        provider,
        Arc::new(TracingErrorReporter),
        &config.llm,
        config.engine.industry.clone(),
    );
    let arbiter = DecisionArbiter::new(pass1, llm, store, config.engine.clone());
    BatchOrchestrator::new(Arc::new(arbiter), queue, config.orchestrator.clone())
}

/// Engine backed by the HTTP provider and a SQLite store
pub fn build_sqlite_orchestrator(
    config: &TomlConfig,
    store: db::SqliteStore,
) -> Result<BatchOrchestrator, error::LlmError> {
    let api_key = crate::config::resolve_llm_api_key(config);
    let provider = HttpLlmProvider::new(&config.llm, api_key)?;
    let store = Arc::new(store);
    Ok(build_orchestrator(config, Arc::new(provider), store.clone(), store))
}
