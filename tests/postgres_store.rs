//! PgRowStore against a live database
//!
//! Run with:
//!   DATABASE_URL=postgres://... cargo test --features database --test postgres_store -- --ignored

#![cfg(feature = "database")]

use serde_json::json;
use uuid::Uuid;

use pro_dispatch::store::row_of;
use pro_dispatch::{DatabaseConfig, PgRowStore, Query, RowStore, StoreError};

async fn store_with_table() -> (PgRowStore, String) {
    let store = PgRowStore::connect(&DatabaseConfig::default())
        .await
        .expect("Failed to connect to database");
    let table = format!("pro_payouts_test_{}", Uuid::new_v4().simple());
    sqlx::query(&format!(
        "CREATE TABLE \"{table}\" (
            id bigserial PRIMARY KEY,
            job_id text NOT NULL,
            pro_id text NOT NULL,
            payout_type text NOT NULL,
            amount numeric(10,2) NOT NULL,
            status text NOT NULL,
            UNIQUE (job_id, pro_id, payout_type)
        )"
    ))
    .execute(store.pool())
    .await
    .expect("create table");
    (store, table)
}

async fn drop_table(store: &PgRowStore, table: &str) {
    let _ = sqlx::query(&format!("DROP TABLE IF EXISTS \"{table}\""))
        .execute(store.pool())
        .await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_upsert_keeps_insert_only_columns() {
    let (store, table) = store_with_table().await;
    let key = ["job_id", "pro_id", "payout_type"];

    let mut row = row_of([
        ("job_id", json!("j1")),
        ("pro_id", json!("p1")),
        ("payout_type", json!("job")),
        ("amount", json!(40.0)),
        ("status", json!("pending")),
    ]);
    let first = store.upsert(&table, &row, &key, &["status"]).await.unwrap();

    row.insert("amount".into(), json!(55.5));
    row.insert("status".into(), json!("approved"));
    let second = store.upsert(&table, &row, &key, &["status"]).await.unwrap();

    assert_eq!(first["id"], second["id"]);
    assert_eq!(second["status"], json!("pending"));
    let rows = store
        .select(&table, &Query::new().eq("job_id", "j1"))
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);

    drop_table(&store, &table).await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_missing_table_and_column_are_classified() {
    let (store, table) = store_with_table().await;

    let err = store
        .select("no_such_table_here", &Query::new().limit(1))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::MissingTable { .. }));

    let row = row_of([("job_id", json!("j1")), ("assigned_to", json!("p1"))]);
    let err = store.insert(&table, &row).await.unwrap_err();
    assert!(err.is_schema_mismatch(), "{err}");

    drop_table(&store, &table).await;
}
