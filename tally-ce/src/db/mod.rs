//! SQLite adapter for the engine's storage traits
//!
//! Every column is read with `try_get`; a row that cannot be decoded never
//! aborts a fetch. Undecodable backlog rows are flagged for review with an
//! audit decision so they leave the backlog, undecodable rules are skipped by
//! the engine and handed to the validator.

use crate::error::StoreError;
use crate::store::{
    BacklogPage, CategorizationStore, RuleListing, RuleSource, TransactionQueue, UndecodableRule,
};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool};
use tally_common::models::{
    CategoryUpdate, Decision, DecisionSource, NormalizedTransaction, RulePattern, TransactionSource,
    VendorEmbedding, VendorRule,
};
use uuid::Uuid;

/// `decided_by` of quarantine decisions
pub const QUARANTINE_DECIDER: &str = "store";

/// Storage adapter over a SQLite pool
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert a transaction as delivered by ingestion
    pub async fn insert_transaction(&self, tx: &NormalizedTransaction) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO transactions (
                id, org_id, date, amount_cents, currency, description,
                merchant_name, mcc, source, category_id, confidence
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&tx.id)
        .bind(&tx.org_id)
        .bind(tx.date.format("%Y-%m-%d").to_string())
        .bind(tx.amount_cents)
        .bind(&tx.currency)
        .bind(&tx.description)
        .bind(&tx.merchant_name)
        .bind(&tx.mcc)
        .bind(tx.source.as_str())
        .bind(tx.prior_category_id.map(|id| id.to_string()))
        .bind(tx.prior_confidence)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_vendor_rule(&self, rule: &VendorRule) -> Result<(), StoreError> {
        let tokens = serde_json::to_string(&rule.pattern.description_tokens)
            .map_err(|e| StoreError::Corrupt(format!("Failed to serialize tokens: {}", e)))?;
        sqlx::query(
            r#"
            INSERT INTO vendor_rules (id, org_id, vendor, mcc, description_tokens, category_id, weight)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(rule.id.to_string())
        .bind(&rule.org_id)
        .bind(&rule.pattern.vendor)
        .bind(&rule.pattern.mcc)
        .bind(tokens)
        .bind(rule.category_id.to_string())
        .bind(i64::from(rule.weight))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_vendor_embedding(
        &self,
        org_id: &str,
        embedding: &VendorEmbedding,
    ) -> Result<(), StoreError> {
        let vector = serde_json::to_string(&embedding.embedding)
            .map_err(|e| StoreError::Corrupt(format!("Failed to serialize embedding: {}", e)))?;
        sqlx::query(
            r#"
            INSERT INTO vendor_embeddings (org_id, vendor, embedding) VALUES (?, ?, ?)
            ON CONFLICT(org_id, vendor) DO UPDATE SET embedding = excluded.embedding
            "#,
        )
        .bind(org_id)
        .bind(&embedding.vendor)
        .bind(vector)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Audit decisions for a transaction, oldest first
    pub async fn decisions_for(&self, tx_id: &str) -> Result<Vec<Decision>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, tx_id, org_id, source, category_id, confidence, rationale, decided_by, created_at
            FROM categorization_decisions
            WHERE tx_id = ?
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(tx_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(decode_decision).collect()
    }

    /// Stored category state of a transaction
    pub async fn category_state(&self, tx_id: &str) -> Result<Option<CategoryUpdate>, StoreError> {
        let row = sqlx::query(
            "SELECT category_id, confidence, needs_review, reviewed FROM transactions WHERE id = ?",
        )
        .bind(tx_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(CategoryUpdate {
                category_id: parse_optional_uuid(column(&row, "category_id")?)?,
                confidence: column(&row, "confidence")?,
                needs_review: column::<i64>(&row, "needs_review")? != 0,
                reviewed: column::<i64>(&row, "reviewed")? != 0,
            })
        })
        .transpose()
    }

    /// Take an undecodable backlog row out of the backlog
    ///
    /// Flags the row for review and records why in the audit log.
    async fn quarantine_transaction(&self, row: UndecodableTransaction) -> Result<(), StoreError> {
        tracing::warn!(
            tx_id = %row.tx_id,
            org_id = %row.org_id,
            error = %row.reason,
            "Undecodable transaction row, flagging for review"
        );

        sqlx::query("UPDATE transactions SET needs_review = 1, updated_at = ? WHERE rowid = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(row.row_key)
            .execute(&self.pool)
            .await?;

        let decision = Decision {
            id: Uuid::new_v4(),
            tx_id: row.tx_id,
            org_id: row.org_id,
            source: DecisionSource::Quarantine,
            category_id: None,
            confidence: None,
            rationale: vec![format!("undecodable transaction row: {}", row.reason)],
            decided_by: QUARANTINE_DECIDER.to_string(),
            created_at: Utc::now(),
        };
        self.insert_decision(&decision).await
    }
}

/// Backlog row that failed to decode
struct UndecodableTransaction {
    row_key: i64,
    tx_id: String,
    org_id: String,
    reason: String,
}

impl UndecodableTransaction {
    fn from_row(row: &SqliteRow, error: StoreError) -> Result<Self, StoreError> {
        let row_key: i64 = column(row, "row_key")?;
        Ok(Self {
            row_key,
            tx_id: column(row, "id").unwrap_or_else(|_| format!("rowid:{}", row_key)),
            org_id: column(row, "org_id").unwrap_or_default(),
            reason: error.to_string(),
        })
    }
}

/// Read one column, mapping type mismatches and unexpected NULLs to `Corrupt`
fn column<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get(name)
        .map_err(|e| StoreError::Corrupt(format!("column {}: {}", name, e)))
}

fn parse_uuid(value: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(value).map_err(|e| StoreError::Corrupt(format!("invalid uuid {:?}: {}", value, e)))
}

fn parse_optional_uuid(value: Option<String>) -> Result<Option<Uuid>, StoreError> {
    value.as_deref().map(parse_uuid).transpose()
}

fn decode_rule(row: &SqliteRow) -> Result<VendorRule, StoreError> {
    let id: String = column(row, "id")?;
    let tokens: String = column(row, "description_tokens")?;
    let description_tokens: Vec<String> = serde_json::from_str(&tokens)
        .map_err(|e| StoreError::Corrupt(format!("rule {} tokens: {}", id, e)))?;
    let category_id: String = column(row, "category_id")?;
    let weight: i64 = column(row, "weight")?;
    let weight = u32::try_from(weight)
        .map_err(|_| StoreError::Corrupt(format!("rule {} weight {} out of range", id, weight)))?;

    Ok(VendorRule {
        id: parse_uuid(&id)?,
        org_id: column(row, "org_id")?,
        pattern: RulePattern {
            vendor: column(row, "vendor")?,
            mcc: column(row, "mcc")?,
            description_tokens,
        },
        category_id: parse_uuid(&category_id)?,
        weight,
    })
}

fn decode_transaction(row: &SqliteRow) -> Result<NormalizedTransaction, StoreError> {
    let id: String = column(row, "id")?;
    let date: String = column(row, "date")?;
    let date = NaiveDate::parse_from_str(date.get(..10).unwrap_or(&date), "%Y-%m-%d")
        .map_err(|e| StoreError::Corrupt(format!("transaction {} date {:?}: {}", id, date, e)))?;
    let source: String = column(row, "source")?;

    Ok(NormalizedTransaction {
        org_id: column(row, "org_id")?,
        date,
        amount_cents: column(row, "amount_cents")?,
        currency: column(row, "currency")?,
        description: column(row, "description")?,
        merchant_name: column(row, "merchant_name")?,
        mcc: column(row, "mcc")?,
        prior_category_id: parse_optional_uuid(column(row, "category_id")?)?,
        prior_confidence: column(row, "confidence")?,
        source: TransactionSource::parse(&source),
        id,
    })
}

fn decode_decision(row: &SqliteRow) -> Result<Decision, StoreError> {
    let id: String = column(row, "id")?;
    let source: String = column(row, "source")?;
    let rationale: String = column(row, "rationale")?;
    let created_at: String = column(row, "created_at")?;

    Ok(Decision {
        id: parse_uuid(&id)?,
        tx_id: column(row, "tx_id")?,
        org_id: column(row, "org_id")?,
        source: serde_json::from_value(serde_json::Value::String(source.clone()))
            .map_err(|e| StoreError::Corrupt(format!("decision {} source {:?}: {}", id, source, e)))?,
        category_id: parse_optional_uuid(column(row, "category_id")?)?,
        confidence: column(row, "confidence")?,
        rationale: serde_json::from_str(&rationale)
            .map_err(|e| StoreError::Corrupt(format!("decision {} rationale: {}", id, e)))?,
        decided_by: column(row, "decided_by")?,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| StoreError::Corrupt(format!("decision {} created_at: {}", id, e)))?
            .with_timezone(&Utc),
    })
}

fn decode_embedding(row: &SqliteRow) -> Result<VendorEmbedding, StoreError> {
    let vendor: String = column(row, "vendor")?;
    let embedding: String = column(row, "embedding")?;
    let embedding = serde_json::from_str(&embedding)
        .map_err(|e| StoreError::Corrupt(format!("embedding for {:?}: {}", vendor, e)))?;
    Ok(VendorEmbedding { vendor, embedding })
}

/// Decode rows, skipping the ones that fail
fn decode_all<T>(
    rows: &[SqliteRow],
    what: &str,
    decode: fn(&SqliteRow) -> Result<T, StoreError>,
) -> Vec<T> {
    rows.iter()
        .filter_map(|row| match decode(row) {
            Ok(item) => Some(item),
            Err(e) => {
                tracing::warn!(kind = what, error = %e, "Skipping undecodable row");
                None
            }
        })
        .collect()
}

const RULE_COLUMNS: &str = "id, org_id, vendor, mcc, description_tokens, category_id, weight";

const TRANSACTION_COLUMNS: &str =
    "rowid AS row_key, id, org_id, date, amount_cents, currency, description, merchant_name, mcc, source, category_id, confidence";

#[async_trait]
impl CategorizationStore for SqliteStore {
    async fn list_vendor_rules(&self, org_id: &str) -> Result<Vec<VendorRule>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM vendor_rules WHERE org_id = ? ORDER BY created_at ASC, rowid ASC",
            RULE_COLUMNS
        ))
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(decode_all(&rows, "vendor_rule", decode_rule))
    }

    async fn list_vendor_embeddings(&self, org_id: &str) -> Result<Vec<VendorEmbedding>, StoreError> {
        let rows = sqlx::query("SELECT vendor, embedding FROM vendor_embeddings WHERE org_id = ?")
            .bind(org_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(decode_all(&rows, "vendor_embedding", decode_embedding))
    }

    async fn update_transaction_category(
        &self,
        tx_id: &str,
        update: &CategoryUpdate,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE transactions
            SET category_id = ?, confidence = ?, needs_review = ?, reviewed = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(update.category_id.map(|id| id.to_string()))
        .bind(update.confidence)
        .bind(update.needs_review as i64)
        .bind(update.reviewed as i64)
        .bind(Utc::now().to_rfc3339())
        .bind(tx_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Corrupt(format!("unknown transaction {}", tx_id)));
        }
        Ok(())
    }

    async fn insert_decision(&self, decision: &Decision) -> Result<(), StoreError> {
        let rationale = serde_json::to_string(&decision.rationale)
            .map_err(|e| StoreError::Corrupt(format!("Failed to serialize rationale: {}", e)))?;
        sqlx::query(
            r#"
            INSERT INTO categorization_decisions (
                id, tx_id, org_id, source, category_id, confidence, rationale, decided_by, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(decision.id.to_string())
        .bind(&decision.tx_id)
        .bind(&decision.org_id)
        .bind(decision.source.as_str())
        .bind(decision.category_id.map(|id| id.to_string()))
        .bind(decision.confidence)
        .bind(rationale)
        .bind(&decision.decided_by)
        .bind(decision.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl TransactionQueue for SqliteStore {
    async fn orgs_with_backlog(&self) -> Result<Vec<String>, StoreError> {
        let orgs: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT org_id FROM transactions \
             WHERE category_id IS NULL AND needs_review = 0 ORDER BY org_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(orgs)
    }

    async fn fetch_uncategorized(&self, org_id: Option<&str>, limit: u32) -> Result<BacklogPage, StoreError> {
        let rows = match org_id {
            Some(org_id) => {
                sqlx::query(&format!(
                    "SELECT {} FROM transactions \
                     WHERE category_id IS NULL AND needs_review = 0 AND org_id = ? \
                     ORDER BY date ASC, rowid ASC LIMIT ?",
                    TRANSACTION_COLUMNS
                ))
                .bind(org_id)
                .bind(i64::from(limit))
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {} FROM transactions \
                     WHERE category_id IS NULL AND needs_review = 0 \
                     ORDER BY date ASC, rowid ASC LIMIT ?",
                    TRANSACTION_COLUMNS
                ))
                .bind(i64::from(limit))
                .fetch_all(&self.pool)
                .await?
            }
        };

        let mut page = BacklogPage {
            transactions: Vec::with_capacity(rows.len()),
            fetched: rows.len(),
        };
        let mut undecodable = Vec::new();
        for row in &rows {
            match decode_transaction(row) {
                Ok(tx) => page.transactions.push(tx),
                Err(e) => undecodable.push(UndecodableTransaction::from_row(row, e)?),
            }
        }
        drop(rows);

        for row in undecodable {
            self.quarantine_transaction(row).await?;
        }
        Ok(page)
    }
}

#[async_trait]
impl RuleSource for SqliteStore {
    async fn list_all_vendor_rules(&self, org_id: Option<&str>) -> Result<RuleListing, StoreError> {
        let rows = match org_id {
            Some(org_id) => {
                sqlx::query(&format!(
                    "SELECT {} FROM vendor_rules WHERE org_id = ? ORDER BY org_id, created_at ASC, rowid ASC",
                    RULE_COLUMNS
                ))
                .bind(org_id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {} FROM vendor_rules ORDER BY org_id, created_at ASC, rowid ASC",
                    RULE_COLUMNS
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };

        let mut listing = RuleListing::default();
        for row in &rows {
            match decode_rule(row) {
                Ok(rule) => listing.rules.push(rule),
                Err(e) => listing.undecodable.push(UndecodableRule {
                    org_id: column(row, "org_id").ok(),
                    rule_id: column(row, "id").unwrap_or_else(|_| "<unreadable id>".to_string()),
                    reason: e.to_string(),
                }),
            }
        }
        Ok(listing)
    }
}
