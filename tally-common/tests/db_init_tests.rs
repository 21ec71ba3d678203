//! Database bootstrap tests

use sqlx::Row;
use tempfile::TempDir;

#[tokio::test]
async fn test_init_creates_file_and_tables() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("nested").join("tally.db");

    let pool = tally_common::db::init_database_pool(&db_path).await.unwrap();
    assert!(db_path.exists());

    let rows = sqlx::query("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
        .fetch_all(&pool)
        .await
        .unwrap();
    let tables: Vec<String> = rows.iter().map(|r| r.get("name")).collect();
    for expected in ["categorization_decisions", "transactions", "vendor_embeddings", "vendor_rules"] {
        assert!(tables.iter().any(|t| t == expected), "missing table {}", expected);
    }
}

#[tokio::test]
async fn test_init_is_idempotent() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("tally.db");

    let pool = tally_common::db::init_database_pool(&db_path).await.unwrap();
    sqlx::query("INSERT INTO transactions (id, org_id, date, amount_cents) VALUES ('t1', 'a', '2024-01-01', 100)")
        .execute(&pool)
        .await
        .unwrap();
    pool.close().await;

    let pool = tally_common::db::init_database_pool(&db_path).await.unwrap();
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM transactions")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 1);
}
