//! Batch Orchestrator
//!
//! Drains the uncategorized backlog in pages. Work is grouped by
//! organization; organizations run concurrently up to the global limit,
//! transactions within one organization run sequentially oldest-first. Each
//! organization's rule/embedding cache is loaded at most once per run.

pub mod limiter;
pub mod worker;

pub use limiter::{ConcurrencyLimiter, InFlightPermit};
pub use worker::{OrgWorkSummary, StopReason, WorkerSummary};

use crate::arbiter::{DecisionArbiter, TransactionOutcome};
use crate::error::StoreError;
use crate::pass1::OrgCache;
use crate::store::TransactionQueue;
use crate::types::CategorizationMode;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tally_common::config::OrchestratorConfig;
use tally_common::models::NormalizedTransaction;

/// Trigger hint from the scheduler
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BatchRequest {
    #[serde(default)]
    pub org_id: Option<String>,
    /// Pages to process in this call (default 1)
    #[serde(default)]
    pub max_batches: Option<u32>,
}

/// Result of one trigger call
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchResponse {
    pub processed: usize,
    pub organizations: usize,
    pub results: Vec<TransactionOutcome>,
    /// More backlog likely remains
    pub needs_another_call: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub rate_limited: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl BatchResponse {
    fn note_rate_limit(&mut self, retry_after_ms: Option<u64>) {
        self.rate_limited = true;
        self.retry_after_ms = match (self.retry_after_ms, retry_after_ms) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }
}

/// Outcome of processing one organization's slice of a page
#[derive(Debug, Default)]
struct OrgRun {
    outcomes: Vec<TransactionOutcome>,
    refused: bool,
    rate_limited: bool,
    retry_after_ms: Option<u64>,
}

/// Per-run organization caches
#[derive(Debug, Default)]
pub(crate) struct RunCaches(HashMap<String, Arc<OrgCache>>);

/// Backlog driver
pub struct BatchOrchestrator {
    arbiter: Arc<DecisionArbiter>,
    queue: Arc<dyn TransactionQueue>,
    limiter: Arc<ConcurrencyLimiter>,
    config: OrchestratorConfig,
}

impl BatchOrchestrator {
    pub fn new(
        arbiter: Arc<DecisionArbiter>,
        queue: Arc<dyn TransactionQueue>,
        config: OrchestratorConfig,
    ) -> Self {
        let limiter = ConcurrencyLimiter::new(config.org_concurrency_limit, config.global_concurrency_limit);
        Self {
            arbiter,
            queue,
            limiter,
            config,
        }
    }

    pub fn limiter(&self) -> &Arc<ConcurrencyLimiter> {
        &self.limiter
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<dyn TransactionQueue> {
        &self.queue
    }

    /// False when Pass-2 will always fall back
    pub fn llm_configured(&self) -> bool {
        self.arbiter.llm_configured()
    }

    /// Process up to `max_batches` pages of backlog
    ///
    /// # Errors
    /// Only a failure to read the backlog itself; per-transaction and
    /// per-organization failures are folded into the response.
    pub async fn run_batch(&self, request: BatchRequest) -> Result<BatchResponse, StoreError> {
        let mut caches = RunCaches::default();
        self.run_batch_with(&request, &mut caches).await
    }

    pub(crate) async fn run_batch_with(
        &self,
        request: &BatchRequest,
        caches: &mut RunCaches,
    ) -> Result<BatchResponse, StoreError> {
        let max_batches = request.max_batches.unwrap_or(1).max(1);
        let page_size = self.config.page_size.max(1);
        let mut response = BatchResponse::default();
        let mut orgs_seen: Vec<String> = Vec::new();

        for step in 0..max_batches {
            let page = self
                .queue
                .fetch_uncategorized(request.org_id.as_deref(), page_size)
                .await?;
            // Undecodable rows the store pulled out of the backlog still fill the page
            let full_page = page.fetched >= page_size as usize;

            if page.fetched == 0 {
                response.needs_another_call = false;
                break;
            }

            let quarantined = page.quarantined();
            if quarantined > 0 {
                tracing::warn!(step, quarantined, "Undecodable backlog rows flagged for review");
            }

            let groups = group_by_org(page.transactions);
            for (org_id, _) in &groups {
                if !orgs_seen.contains(org_id) {
                    orgs_seen.push(org_id.clone());
                }
            }

            let runs = self.run_page(groups, caches).await;

            let mut progressed = quarantined > 0;
            for run in runs {
                progressed |= !run.outcomes.is_empty();
                response.processed += run.outcomes.len();
                response.results.extend(run.outcomes);
                if run.refused {
                    response.note_rate_limit(Some(self.config.admission_backoff_ms));
                }
                if run.rate_limited {
                    response.note_rate_limit(run.retry_after_ms);
                }
            }

            tracing::debug!(
                step,
                processed = response.processed,
                rate_limited = response.rate_limited,
                "Batch step complete"
            );

            response.needs_another_call = full_page || response.rate_limited;
            if response.rate_limited || !progressed || !full_page {
                break;
            }
        }

        response.organizations = orgs_seen.len();
        tracing::info!(
            org_id = ?request.org_id,
            processed = response.processed,
            organizations = response.organizations,
            needs_another_call = response.needs_another_call,
            rate_limited = response.rate_limited,
            "Batch finished"
        );
        Ok(response)
    }

    async fn run_page(
        &self,
        groups: Vec<(String, Vec<NormalizedTransaction>)>,
        caches: &mut RunCaches,
    ) -> Vec<OrgRun> {
        let concurrency = self.limiter.global_limit();
        let known: Vec<Option<Arc<OrgCache>>> = groups
            .iter()
            .map(|(org_id, _)| caches.0.get(org_id).cloned())
            .collect();

        let results: Vec<(String, Option<Arc<OrgCache>>, OrgRun)> = stream::iter(groups.into_iter().zip(known))
            .map(|((org_id, txs), cache)| async move {
                let (cache, run) = self
                    .admit_and_process(&org_id, &txs, cache, CategorizationMode::Ingestion)
                    .await;
                (org_id, cache, run)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        results
            .into_iter()
            .map(|(org_id, cache, run)| {
                if let Some(cache) = cache {
                    caches.0.entry(org_id).or_insert(cache);
                }
                run
            })
            .collect()
    }

    async fn admit_and_process(
        &self,
        org_id: &str,
        txs: &[NormalizedTransaction],
        cache: Option<Arc<OrgCache>>,
        mode: CategorizationMode,
    ) -> (Option<Arc<OrgCache>>, OrgRun) {
        let Some(permit) = self.limiter.try_acquire(org_id) else {
            tracing::info!(org_id = %org_id, "Organization at concurrency limit, deferring");
            return (
                cache,
                OrgRun {
                    refused: true,
                    ..Default::default()
                },
            );
        };

        let cache = match cache {
            Some(cache) => cache,
            None => Arc::new(OrgCache::load(self.arbiter.store().as_ref(), org_id).await),
        };
        let run = self.process_org(org_id, txs, &cache, mode).await;
        drop(permit);
        (Some(cache), run)
    }

    /// Sequentially decide an organization's transactions
    ///
    /// Stops early once the provider reports rate limiting; remaining
    /// transactions stay in the backlog.
    async fn process_org(
        &self,
        org_id: &str,
        txs: &[NormalizedTransaction],
        cache: &OrgCache,
        mode: CategorizationMode,
    ) -> OrgRun {
        let mut run = OrgRun::default();
        for tx in txs {
            let outcome = self.arbiter.decide(tx, cache, mode).await;
            let limited = outcome.rate_limited;
            let retry_after_ms = outcome.retry_after_ms;
            run.outcomes.push(outcome);
            if limited {
                tracing::warn!(
                    org_id = %org_id,
                    tx_id = %tx.id,
                    retry_after_ms = ?retry_after_ms,
                    "Provider rate limited, stopping organization early"
                );
                run.rate_limited = true;
                run.retry_after_ms = retry_after_ms;
                break;
            }
        }
        run
    }

    /// Re-run already-categorized transactions of one organization
    ///
    /// Uses the stricter re-categorization thresholds; a changed category is
    /// always flagged for review.
    pub async fn recategorize(&self, org_id: &str, txs: Vec<NormalizedTransaction>) -> BatchResponse {
        let mut txs: Vec<NormalizedTransaction> = txs.into_iter().filter(|t| t.org_id == org_id).collect();
        txs.sort_by(|a, b| a.date.cmp(&b.date));

        let mut response = BatchResponse {
            organizations: usize::from(!txs.is_empty()),
            ..Default::default()
        };
        if txs.is_empty() {
            return response;
        }

        let (_, run) = self
            .admit_and_process(org_id, &txs, None, CategorizationMode::Recategorization)
            .await;
        if run.refused {
            response.note_rate_limit(Some(self.config.admission_backoff_ms));
        }
        if run.rate_limited {
            response.note_rate_limit(run.retry_after_ms);
        }
        response.processed = run.outcomes.len();
        response.needs_another_call = response.processed < txs.len();
        response.results = run.outcomes;

        tracing::info!(
            org_id = %org_id,
            processed = response.processed,
            requested = txs.len(),
            "Re-categorization finished"
        );
        response
    }
}

/// Group a page by organization, keeping first-seen org order and page order
fn group_by_org(page: Vec<NormalizedTransaction>) -> Vec<(String, Vec<NormalizedTransaction>)> {
    let mut groups: Vec<(String, Vec<NormalizedTransaction>)> = Vec::new();
    for tx in page {
        match groups.iter_mut().find(|(org, _)| *org == tx.org_id) {
            Some((_, txs)) => txs.push(tx),
            None => groups.push((tx.org_id.clone(), vec![tx])),
        }
    }
    groups
}
