//! Worker loop
//!
//! Walks every organization with backlog and repeatedly calls the batch step
//! for it until the step reports no more work, the per-organization call
//! ceiling is hit, or the organization errors. Rate-limit waits are capped by
//! `max_backoff_ms` so one invocation cannot hang.

use super::{BatchOrchestrator, BatchRequest, RunCaches};
use crate::error::StoreError;
use serde::Serialize;
use std::time::Duration;

/// Why the worker moved on from an organization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    NoMoreWork,
    CallCeiling,
    Error,
}

/// Per-organization worker summary
#[derive(Debug, Clone, Serialize)]
pub struct OrgWorkSummary {
    pub org_id: String,
    pub calls: u32,
    pub processed: usize,
    pub rate_limited_waits: u32,
    pub stopped: StopReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of one worker pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerSummary {
    pub organizations: Vec<OrgWorkSummary>,
    pub processed: usize,
}

impl BatchOrchestrator {
    /// Bounded wait before retrying a rate-limited organization
    pub fn backoff_for(&self, retry_after_ms: Option<u64>) -> Duration {
        let config = self.config();
        let suggested = retry_after_ms.unwrap_or(config.admission_backoff_ms);
        Duration::from_millis(suggested.min(config.max_backoff_ms))
    }

    /// One full worker pass over all organizations with backlog
    ///
    /// # Errors
    /// Only when the list of organizations cannot be read.
    pub async fn run_worker(&self) -> Result<WorkerSummary, StoreError> {
        let orgs = self.queue().orgs_with_backlog().await?;
        tracing::info!(organizations = orgs.len(), "Worker pass starting");

        let mut caches = RunCaches::default();
        let mut summary = WorkerSummary::default();

        for org_id in orgs {
            let org_summary = self.drain_org(&org_id, &mut caches).await;
            summary.processed += org_summary.processed;
            summary.organizations.push(org_summary);
        }

        tracing::info!(
            organizations = summary.organizations.len(),
            processed = summary.processed,
            "Worker pass finished"
        );
        Ok(summary)
    }

    async fn drain_org(&self, org_id: &str, caches: &mut RunCaches) -> OrgWorkSummary {
        let max_calls = self.config().max_calls_per_org.max(1);
        let request = BatchRequest {
            org_id: Some(org_id.to_string()),
            max_batches: Some(1),
        };
        let mut summary = OrgWorkSummary {
            org_id: org_id.to_string(),
            calls: 0,
            processed: 0,
            rate_limited_waits: 0,
            stopped: StopReason::CallCeiling,
            error: None,
        };

        while summary.calls < max_calls {
            summary.calls += 1;
            let response = match self.run_batch_with(&request, caches).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::error!(org_id = %org_id, error = %e, "Batch step failed, skipping organization");
                    summary.stopped = StopReason::Error;
                    summary.error = Some(e.to_string());
                    return summary;
                }
            };
            summary.processed += response.processed;

            if response.rate_limited {
                let wait = self.backoff_for(response.retry_after_ms);
                summary.rate_limited_waits += 1;
                tracing::info!(
                    org_id = %org_id,
                    wait_ms = wait.as_millis() as u64,
                    "Rate limited, backing off"
                );
                tokio::time::sleep(wait).await;
                continue;
            }

            if !response.needs_another_call {
                summary.stopped = StopReason::NoMoreWork;
                break;
            }
        }

        if summary.stopped == StopReason::CallCeiling {
            tracing::info!(org_id = %org_id, calls = summary.calls, "Per-organization call ceiling reached");
        }
        summary
    }
}
