#![cfg(feature = "storage-postgres")]

mod common;

use common::{balance_of, create_account};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use txledger::application::LedgerStore;
use txledger::context::TxContext;
use txledger::domain::account::Amount;
use txledger::domain::transfer::TransferTxParams;
use txledger::infrastructure::postgres::PostgresBackend;

static SCHEMA: OnceCell<()> = OnceCell::const_new();

/// Connects to `DATABASE_URL`, or returns `None` so the test is skipped.
///
/// The schema is created once per test binary; concurrent
/// `CREATE TABLE IF NOT EXISTS` statements can race on the catalog.
async fn postgres_store() -> Option<LedgerStore> {
    let url = match std::env::var("DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("DATABASE_URL not set, skipping");
            return None;
        }
    };
    let backend = PostgresBackend::connect(&url, 10, Duration::from_secs(5))
        .await
        .unwrap();
    SCHEMA
        .get_or_init(|| async { backend.ensure_schema().await.unwrap() })
        .await;
    Some(LedgerStore::new(Arc::new(backend)))
}

fn params(from: i64, to: i64, amount: i64) -> TransferTxParams {
    TransferTxParams {
        from_account_id: from,
        to_account_id: to,
        amount: Amount::new(amount).unwrap(),
    }
}

#[tokio::test]
async fn test_postgres_transfer() {
    let Some(store) = postgres_store().await else {
        return;
    };
    let a = create_account(&store, 1000).await;
    let b = create_account(&store, 500).await;

    let result = store
        .transfer_tx(&TxContext::background(), params(a.id, b.id, 300))
        .await
        .unwrap();

    assert_eq!(result.from_account.balance, 700);
    assert_eq!(result.to_account.balance, 800);
    assert_eq!(result.from_entry.amount, -300);
    assert_eq!(result.to_entry.amount, 300);
}

#[tokio::test]
async fn test_postgres_missing_account_is_not_found() {
    let Some(store) = postgres_store().await else {
        return;
    };
    let a = create_account(&store, 1000).await;

    let err = store
        .transfer_tx(&TxContext::background(), params(a.id, i64::MAX, 10))
        .await
        .unwrap_err();
    assert!(err.is_not_found(), "{err}");
    assert_eq!(balance_of(&store, a.id).await, 1000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_postgres_concurrent_transfers_are_serializable() {
    let Some(store) = postgres_store().await else {
        return;
    };
    let a = create_account(&store, 1000).await;
    let b = create_account(&store, 1000).await;
    let n = 5;

    let handles: Vec<_> = (0..n)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .transfer_tx(&TxContext::background(), params(a.id, b.id, 10))
                    .await
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for handle in handles {
        let result = handle.await.unwrap().unwrap();
        let k = (a.balance - result.from_account.balance) / 10;
        assert!((1..=n).contains(&k));
        assert!(seen.insert(k));
    }
    assert_eq!(balance_of(&store, a.id).await, 1000 - n * 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_postgres_opposing_transfers_do_not_deadlock() {
    let Some(store) = postgres_store().await else {
        return;
    };
    let a = create_account(&store, 1000).await;
    let b = create_account(&store, 1000).await;

    let handles: Vec<_> = (0..10)
        .map(|i| {
            let store = store.clone();
            let (from, to) = if i % 2 == 1 { (b.id, a.id) } else { (a.id, b.id) };
            tokio::spawn(async move {
                store
                    .transfer_tx(&TxContext::background(), params(from, to, 10))
                    .await
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(balance_of(&store, a.id).await, 1000);
    assert_eq!(balance_of(&store, b.id).await, 1000);
}
