//! Integration tests for the batch orchestrator, worker loop and limiter

use async_trait::async_trait;
use chrono::NaiveDate;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;
use tally_ce::error::LlmError;
use tally_ce::llm::{LlmProvider, LlmRequest};
use tally_ce::orchestrator::{BatchRequest, ConcurrencyLimiter, StopReason};
use tally_ce::store::{MemoryFailures, MemoryStore};
use tally_ce::taxonomy::taxonomy;
use tally_ce::types::CategorizationMode;
use tally_common::config::TomlConfig;
use tally_common::models::{DecisionSource, NormalizedTransaction, TransactionSource};
use uuid::Uuid;

enum Reply {
    Json(&'static str),
    RateLimited(u64),
}

struct TestProvider {
    reply: Reply,
    delay: Duration,
    calls: AtomicUsize,
}

impl TestProvider {
    fn new(reply: Reply) -> Arc<Self> {
        Arc::new(Self {
            reply,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        })
    }

    fn slow(reply: Reply, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            reply,
            delay,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl LlmProvider for TestProvider {
    fn model(&self) -> &str {
        "test-model"
    }

    async fn complete(&self, _request: &LlmRequest) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match self.reply {
            Reply::Json(s) => Ok(s.to_string()),
            Reply::RateLimited(ms) => Err(LlmError::RateLimited {
                retry_after_ms: Some(ms),
            }),
        }
    }
}

fn tx(id: &str, org: &str, day: u32, description: &str) -> NormalizedTransaction {
    NormalizedTransaction {
        id: id.to_string(),
        org_id: org.to_string(),
        date: NaiveDate::from_ymd_opt(2024, 6, day).unwrap(),
        amount_cents: -12_000,
        currency: "USD".to_string(),
        description: description.to_string(),
        merchant_name: None,
        mcc: None,
        prior_category_id: None,
        prior_confidence: None,
        source: TransactionSource::BankFeed,
    }
}

fn config(page_size: u32) -> TomlConfig {
    let mut config = TomlConfig::default();
    config.orchestrator.page_size = page_size;
    config.orchestrator.max_backoff_ms = 10;
    config.orchestrator.admission_backoff_ms = 5;
    config
}

fn orchestrator(
    config: &TomlConfig,
    provider: Arc<TestProvider>,
    store: &Arc<MemoryStore>,
) -> tally_ce::orchestrator::BatchOrchestrator {
    tally_ce::build_orchestrator(config, provider, store.clone(), store.clone())
}

const INSURANCE: &str = r#"{"category_slug":"insurance","confidence":0.9,"rationale":"policy"}"#;

#[tokio::test]
async fn test_batch_processes_all_orgs_oldest_first() {
    let store = Arc::new(MemoryStore::new());
    store.add_transaction(tx("a3", "a", 3, "ACME POLICY"));
    store.add_transaction(tx("a1", "a", 1, "ACME POLICY"));
    store.add_transaction(tx("b1", "b", 2, "ACME POLICY"));
    store.add_transaction(tx("a2", "a", 2, "ACME POLICY"));

    let orch = orchestrator(&config(50), TestProvider::new(Reply::Json(INSURANCE)), &store);
    let response = orch.run_batch(BatchRequest::default()).await.unwrap();

    assert_eq!(response.processed, 4);
    assert_eq!(response.organizations, 2);
    assert!(!response.needs_another_call);
    assert!(!response.rate_limited);

    let org_a: Vec<&str> = response
        .results
        .iter()
        .filter(|r| r.org_id == "a")
        .map(|r| r.tx_id.as_str())
        .collect();
    assert_eq!(org_a, vec!["a1", "a2", "a3"]);

    assert_eq!(store.decisions().len(), 4);
    let insurance = taxonomy().get_by_slug("insurance").unwrap().id;
    assert!(response.results.iter().all(|r| r.category_id == Some(insurance)));
    assert!(response.results.iter().all(|r| r.source == DecisionSource::Llm));
}

#[tokio::test]
async fn test_org_cache_loaded_once_per_run() {
    let store = Arc::new(MemoryStore::new());
    for day in 1..=5 {
        store.add_transaction(tx(&format!("t{}", day), "a", day, "ACME POLICY"));
    }

    let orch = orchestrator(&config(2), TestProvider::new(Reply::Json(INSURANCE)), &store);
    let response = orch
        .run_batch(BatchRequest {
            org_id: Some("a".to_string()),
            max_batches: Some(3),
        })
        .await
        .unwrap();

    assert_eq!(response.processed, 5);
    assert!(!response.needs_another_call);
    assert_eq!(store.rule_fetches(), 1);
}

#[tokio::test]
async fn test_full_page_requests_another_call() {
    let store = Arc::new(MemoryStore::new());
    for day in 1..=3 {
        store.add_transaction(tx(&format!("t{}", day), "a", day, "ACME POLICY"));
    }

    let orch = orchestrator(&config(2), TestProvider::new(Reply::Json(INSURANCE)), &store);
    let response = orch.run_batch(BatchRequest::default()).await.unwrap();

    assert_eq!(response.processed, 2);
    assert!(response.needs_another_call);
}

#[tokio::test]
async fn test_upstream_rate_limit_stops_org_early() {
    let store = Arc::new(MemoryStore::new());
    for day in 1..=3 {
        store.add_transaction(tx(&format!("t{}", day), "a", day, "UNKNOWN PAYEE"));
    }

    let provider = TestProvider::new(Reply::RateLimited(1_500));
    let orch = orchestrator(&config(50), provider.clone(), &store);
    let response = orch.run_batch(BatchRequest::default()).await.unwrap();

    assert_eq!(response.processed, 1);
    assert!(response.rate_limited);
    assert_eq!(response.retry_after_ms, Some(1_500));
    assert!(response.needs_another_call);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

    // The rate-limited transaction still got the safe fallback
    let update = store.update_for("t1").unwrap();
    assert!(update.needs_review);
    assert_eq!(update.confidence, Some(0.5));
    assert!(store.update_for("t2").is_none());
}

#[tokio::test]
async fn test_concurrent_admission_for_same_org_is_refused() {
    let store = Arc::new(MemoryStore::new());
    store.add_transaction(tx("t1", "a", 1, "UNKNOWN PAYEE"));
    store.add_transaction(tx("t2", "a", 2, "UNKNOWN PAYEE"));

    let provider = TestProvider::slow(Reply::Json(INSURANCE), Duration::from_millis(50));
    let orch = orchestrator(&config(50), provider, &store);

    let (first, second) = tokio::join!(
        orch.run_batch(BatchRequest::default()),
        orch.run_batch(BatchRequest::default())
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    let refused: Vec<_> = [&first, &second].into_iter().filter(|r| r.rate_limited).collect();
    assert_eq!(refused.len(), 1);
    assert_eq!(refused[0].processed, 0);
    assert_eq!(refused[0].retry_after_ms, Some(5));
    assert_eq!(first.processed + second.processed, 2);
    assert_eq!(store.decisions().len(), 2);
    assert_eq!(orch.limiter().global_in_flight(), 0);
}

#[tokio::test]
async fn test_worker_drains_until_no_more_work() {
    let store = Arc::new(MemoryStore::new());
    store.add_transaction(tx("a1", "a", 1, "ACME POLICY"));
    store.add_transaction(tx("a2", "a", 2, "ACME POLICY"));
    store.add_transaction(tx("b1", "b", 1, "ACME POLICY"));

    let orch = orchestrator(&config(1), TestProvider::new(Reply::Json(INSURANCE)), &store);
    let summary = orch.run_worker().await.unwrap();

    assert_eq!(summary.processed, 3);
    assert_eq!(summary.organizations.len(), 2);
    assert!(summary
        .organizations
        .iter()
        .all(|o| o.stopped == StopReason::NoMoreWork));
    // One rule/embedding load per organization for the whole pass
    assert_eq!(store.rule_fetches(), 2);
}

#[tokio::test]
async fn test_worker_backoff_is_bounded_and_ceiling_applies() {
    let store = Arc::new(MemoryStore::new());
    for day in 1..=5 {
        store.add_transaction(tx(&format!("t{}", day), "a", day, "UNKNOWN PAYEE"));
    }

    let mut cfg = config(1);
    cfg.orchestrator.max_calls_per_org = 3;
    let orch = orchestrator(&cfg, TestProvider::new(Reply::RateLimited(60_000)), &store);

    assert_eq!(orch.backoff_for(Some(60_000)), Duration::from_millis(10));
    assert_eq!(orch.backoff_for(None), Duration::from_millis(5));

    let started = std::time::Instant::now();
    let summary = orch.run_worker().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));

    let org = &summary.organizations[0];
    assert_eq!(org.stopped, StopReason::CallCeiling);
    assert_eq!(org.calls, 3);
    assert_eq!(org.rate_limited_waits, 3);
    assert_eq!(org.processed, 3);
}

#[tokio::test]
async fn test_worker_fails_only_when_backlog_unreadable() {
    let store = Arc::new(MemoryStore::new());
    store.set_failures(MemoryFailures {
        queue: true,
        ..Default::default()
    });
    let orch = orchestrator(&config(10), TestProvider::new(Reply::Json(INSURANCE)), &store);
    assert!(orch.run_worker().await.is_err());
}

#[tokio::test]
async fn test_rule_store_outage_degrades_to_no_rules() {
    let store = Arc::new(MemoryStore::new());
    store.set_failures(MemoryFailures {
        rules: true,
        ..Default::default()
    });
    let mut barber = tx("t1", "a", 1, "CLIPPERS");
    barber.mcc = Some("7230".to_string());
    barber.amount_cents = 4_500;
    store.add_transaction(barber);

    let orch = orchestrator(&config(10), TestProvider::new(Reply::Json(INSURANCE)), &store);
    let response = orch.run_batch(BatchRequest::default()).await.unwrap();

    assert_eq!(response.processed, 1);
    assert_eq!(response.results[0].source, DecisionSource::Pass1);
    assert_eq!(response.results[0].confidence, Some(0.90));
}

#[tokio::test]
async fn test_recategorization_flags_changed_categories() {
    let store = Arc::new(MemoryStore::new());
    let rent = taxonomy().get_by_slug("rent").unwrap().id;
    let hair = taxonomy().get_by_slug("hair_services").unwrap().id;

    let mut unchanged = tx("r1", "a", 1, "Monthly rent");
    unchanged.prior_category_id = Some(rent);
    let mut changed = tx("r2", "a", 2, "Monthly rent");
    changed.prior_category_id = Some(hair);
    store.add_transaction(unchanged.clone());
    store.add_transaction(changed.clone());

    let provider = TestProvider::new(Reply::Json(r#"{"category_slug":"rent","confidence":0.95}"#));
    let orch = orchestrator(&config(10), provider, &store);
    let response = orch.recategorize("a", vec![changed, unchanged]).await;

    assert_eq!(response.processed, 2);
    assert!(!response.needs_another_call);
    let by_id = |id: &str| response.results.iter().find(|r| r.tx_id == id).unwrap();
    assert_eq!(by_id("r1").category_id, Some(rent));
    assert!(!by_id("r1").needs_review);
    assert_eq!(by_id("r2").category_id, Some(rent));
    assert!(by_id("r2").needs_review);
    assert!(response
        .results
        .iter()
        .all(|r| r.source == DecisionSource::RecategorizationLlm));
    assert_eq!(response.results[0].tx_id, "r1");
}

#[test]
fn test_limiter_never_exceeds_limits_under_contention() {
    const THREADS: usize = 16;
    let limiter = ConcurrencyLimiter::new(2, 5);
    let barrier = Arc::new(Barrier::new(THREADS));
    let violations = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..THREADS)
        .map(|i| {
            let limiter = Arc::clone(&limiter);
            let barrier = Arc::clone(&barrier);
            let violations = Arc::clone(&violations);
            std::thread::spawn(move || {
                let org = format!("org-{}", i % 3);
                barrier.wait();
                for _ in 0..2_000 {
                    if let Some(permit) = limiter.try_acquire(&org) {
                        if limiter.in_flight(&org) > 2 || limiter.global_in_flight() > 5 {
                            violations.fetch_add(1, Ordering::SeqCst);
                        }
                        drop(permit);
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(violations.load(Ordering::SeqCst), 0);
    assert_eq!(limiter.global_in_flight(), 0);
    for i in 0..3 {
        assert_eq!(limiter.in_flight(&format!("org-{}", i)), 0);
    }
}

#[test]
fn test_mode_default_is_ingestion() {
    assert_eq!(CategorizationMode::default(), CategorizationMode::Ingestion);
    assert_ne!(Uuid::nil(), taxonomy().map_slug_to_id("anything"));
}
