//! Narrow storage interfaces the engine depends on
//!
//! The engine never sees a database handle. The SQLite adapter lives in
//! [`crate::db`]; [`MemoryStore`] is an in-process implementation used for
//! dry runs and tests.

use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Mutex;
use tally_common::models::{CategoryUpdate, Decision, NormalizedTransaction, VendorEmbedding, VendorRule};

/// Reads rules/embeddings and writes categorization outcomes
#[async_trait]
pub trait CategorizationStore: Send + Sync {
    async fn list_vendor_rules(&self, org_id: &str) -> Result<Vec<VendorRule>, StoreError>;

    async fn list_vendor_embeddings(&self, org_id: &str) -> Result<Vec<VendorEmbedding>, StoreError>;

    async fn update_transaction_category(
        &self,
        tx_id: &str,
        update: &CategoryUpdate,
    ) -> Result<(), StoreError>;

    /// Append an audit decision (never updates existing rows)
    async fn insert_decision(&self, decision: &Decision) -> Result<(), StoreError>;
}

/// One page read from the backlog
#[derive(Debug, Clone, Default)]
pub struct BacklogPage {
    pub transactions: Vec<NormalizedTransaction>,
    /// Rows read, including undecodable ones the store took out of the backlog
    pub fetched: usize,
}

impl BacklogPage {
    pub fn new(transactions: Vec<NormalizedTransaction>) -> Self {
        Self {
            fetched: transactions.len(),
            transactions,
        }
    }

    /// Rows that left the backlog without being categorized
    pub fn quarantined(&self) -> usize {
        self.fetched.saturating_sub(self.transactions.len())
    }
}

/// Source of transactions awaiting categorization
#[async_trait]
pub trait TransactionQueue: Send + Sync {
    /// Organizations with at least one uncategorized transaction
    async fn orgs_with_backlog(&self) -> Result<Vec<String>, StoreError>;

    /// Uncategorized transactions, oldest first
    ///
    /// Rows that cannot be decoded must leave the backlog (flagged for
    /// review) and still count toward `fetched`.
    async fn fetch_uncategorized(&self, org_id: Option<&str>, limit: u32) -> Result<BacklogPage, StoreError>;
}

/// Stored rule row that could not be decoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndecodableRule {
    pub org_id: Option<String>,
    pub rule_id: String,
    pub reason: String,
}

/// Every stored rule in a validation scope
#[derive(Debug, Clone, Default)]
pub struct RuleListing {
    pub rules: Vec<VendorRule>,
    pub undecodable: Vec<UndecodableRule>,
}

impl RuleListing {
    /// Stored rows, decodable or not
    pub fn total(&self) -> usize {
        self.rules.len() + self.undecodable.len()
    }
}

/// Full rule listing for offline validation
#[async_trait]
pub trait RuleSource: Send + Sync {
    async fn list_all_vendor_rules(&self, org_id: Option<&str>) -> Result<RuleListing, StoreError>;
}

#[derive(Debug, Clone)]
struct StoredTransaction {
    tx: NormalizedTransaction,
    update: Option<CategoryUpdate>,
}

#[derive(Debug, Default)]
struct MemoryState {
    transactions: Vec<StoredTransaction>,
    rules: Vec<VendorRule>,
    embeddings: Vec<(String, VendorEmbedding)>,
    decisions: Vec<Decision>,
    rule_fetches: usize,
}

/// Failure switches for exercising degraded paths
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryFailures {
    pub rules: bool,
    pub updates: bool,
    pub decisions: bool,
    pub queue: bool,
}

/// In-process store
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    failures: Mutex<MemoryFailures>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn failures(&self) -> MemoryFailures {
        *self.failures.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_failures(&self, failures: MemoryFailures) {
        *self.failures.lock().unwrap_or_else(|e| e.into_inner()) = failures;
    }

    pub fn add_transaction(&self, tx: NormalizedTransaction) {
        self.state().transactions.push(StoredTransaction { tx, update: None });
    }

    pub fn add_rule(&self, rule: VendorRule) {
        self.state().rules.push(rule);
    }

    pub fn add_embedding(&self, org_id: &str, embedding: VendorEmbedding) {
        self.state().embeddings.push((org_id.to_string(), embedding));
    }

    /// All audit decisions in insertion order
    pub fn decisions(&self) -> Vec<Decision> {
        self.state().decisions.clone()
    }

    /// Latest category write for a transaction
    pub fn update_for(&self, tx_id: &str) -> Option<CategoryUpdate> {
        self.state()
            .transactions
            .iter()
            .find(|t| t.tx.id == tx_id)
            .and_then(|t| t.update.clone())
    }

    /// Number of `list_vendor_rules` calls served
    pub fn rule_fetches(&self) -> usize {
        self.state().rule_fetches
    }

    fn is_backlog(t: &StoredTransaction) -> bool {
        match &t.update {
            None => t.tx.prior_category_id.is_none(),
            Some(u) => u.category_id.is_none() && !u.needs_review,
        }
    }
}

#[async_trait]
impl CategorizationStore for MemoryStore {
    async fn list_vendor_rules(&self, org_id: &str) -> Result<Vec<VendorRule>, StoreError> {
        let failures = self.failures();
        let mut state = self.state();
        state.rule_fetches += 1;
        if failures.rules {
            return Err(StoreError::Unavailable("rule store offline".to_string()));
        }
        Ok(state.rules.iter().filter(|r| r.org_id == org_id).cloned().collect())
    }

    async fn list_vendor_embeddings(&self, org_id: &str) -> Result<Vec<VendorEmbedding>, StoreError> {
        if self.failures().rules {
            return Err(StoreError::Unavailable("rule store offline".to_string()));
        }
        Ok(self
            .state()
            .embeddings
            .iter()
            .filter(|(org, _)| org == org_id)
            .map(|(_, e)| e.clone())
            .collect())
    }

    async fn update_transaction_category(
        &self,
        tx_id: &str,
        update: &CategoryUpdate,
    ) -> Result<(), StoreError> {
        if self.failures().updates {
            return Err(StoreError::Unavailable("transaction update failed".to_string()));
        }
        let mut state = self.state();
        match state.transactions.iter_mut().find(|t| t.tx.id == tx_id) {
            Some(t) => {
                t.update = Some(update.clone());
                Ok(())
            }
            None => Err(StoreError::Corrupt(format!("unknown transaction {}", tx_id))),
        }
    }

    async fn insert_decision(&self, decision: &Decision) -> Result<(), StoreError> {
        if self.failures().decisions {
            return Err(StoreError::Unavailable("audit log unavailable".to_string()));
        }
        self.state().decisions.push(decision.clone());
        Ok(())
    }
}

#[async_trait]
impl TransactionQueue for MemoryStore {
    async fn orgs_with_backlog(&self) -> Result<Vec<String>, StoreError> {
        if self.failures().queue {
            return Err(StoreError::Unavailable("queue offline".to_string()));
        }
        let orgs: BTreeSet<String> = self
            .state()
            .transactions
            .iter()
            .filter(|t| Self::is_backlog(t))
            .map(|t| t.tx.org_id.clone())
            .collect();
        Ok(orgs.into_iter().collect())
    }

    async fn fetch_uncategorized(&self, org_id: Option<&str>, limit: u32) -> Result<BacklogPage, StoreError> {
        if self.failures().queue {
            return Err(StoreError::Unavailable("queue offline".to_string()));
        }
        let mut txs: Vec<NormalizedTransaction> = self
            .state()
            .transactions
            .iter()
            .filter(|t| Self::is_backlog(t))
            .filter(|t| org_id.map_or(true, |org| t.tx.org_id == org))
            .map(|t| t.tx.clone())
            .collect();
        // Stable sort keeps insertion order for same-day rows
        txs.sort_by(|a, b| a.date.cmp(&b.date));
        txs.truncate(limit as usize);
        Ok(BacklogPage::new(txs))
    }
}

#[async_trait]
impl RuleSource for MemoryStore {
    async fn list_all_vendor_rules(&self, org_id: Option<&str>) -> Result<RuleListing, StoreError> {
        let rules = self
            .state()
            .rules
            .iter()
            .filter(|r| org_id.map_or(true, |org| r.org_id == org))
            .cloned()
            .collect();
        Ok(RuleListing {
            rules,
            undecodable: Vec::new(),
        })
    }
}
