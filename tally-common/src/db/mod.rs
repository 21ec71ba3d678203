//! Database bootstrap for the categorization engine
//!
//! Only the tables the engine reads or writes are created here; the wider
//! application schema belongs to its own migrations.

use crate::Result;
use sqlx::SqlitePool;
use std::path::Path;

/// Initialize database connection pool
///
/// Opens (or creates) the SQLite file and ensures engine tables exist.
pub async fn init_database_pool(db_path: &Path) -> Result<SqlitePool> {
    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Use proper SQLite URI with mode=rwc (read, write, create)
    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    tracing::debug!("Connecting to database: {}", db_url);

    let pool = SqlitePool::connect(&db_url).await?;

    init_tables(&pool).await?;

    Ok(pool)
}

/// Create engine tables if they don't exist
pub async fn init_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS transactions (
            id TEXT PRIMARY KEY,
            org_id TEXT NOT NULL,
            date TEXT NOT NULL,
            amount_cents INTEGER NOT NULL,
            currency TEXT NOT NULL DEFAULT 'USD',
            description TEXT NOT NULL DEFAULT '',
            merchant_name TEXT,
            mcc TEXT,
            source TEXT NOT NULL DEFAULT 'bank_feed',
            category_id TEXT,
            confidence REAL,
            needs_review INTEGER NOT NULL DEFAULT 0,
            reviewed INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_transactions_backlog \
         ON transactions (org_id, category_id, needs_review, date)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS vendor_rules (
            id TEXT PRIMARY KEY,
            org_id TEXT NOT NULL,
            vendor TEXT,
            mcc TEXT,
            description_tokens TEXT NOT NULL DEFAULT '[]',
            category_id TEXT NOT NULL,
            weight INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS vendor_embeddings (
            org_id TEXT NOT NULL,
            vendor TEXT NOT NULL,
            embedding TEXT NOT NULL DEFAULT '[]',
            PRIMARY KEY (org_id, vendor)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS categorization_decisions (
            id TEXT PRIMARY KEY,
            tx_id TEXT NOT NULL,
            org_id TEXT NOT NULL,
            source TEXT NOT NULL,
            category_id TEXT,
            confidence REAL,
            rationale TEXT NOT NULL DEFAULT '[]',
            decided_by TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    tracing::info!(
        "Database tables initialized (transactions, vendor_rules, vendor_embeddings, categorization_decisions)"
    );

    Ok(())
}
