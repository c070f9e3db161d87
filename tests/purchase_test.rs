//! Integration tests for purchase crediting.
//!
//! Covers:
//! 1. A purchased transaction grants credits, audits, and finishes once
//! 2. Exhausted cloud retries still finish the transaction and keep the grant
//! 3. Restored transactions credit like purchases
//! 4. Failed transactions finish without granting
//! 5. Unknown products finish without granting

use std::sync::Arc;

use serde_json::json;

use creditd::cloud::MemoryCloudStore;
use creditd::config::DaemonConfig;
use creditd::purchases::{RecordingPlatform, TransactionState};
use creditd::retry::RetryConfig;
use creditd::AppContext;

// ─── Helpers ──────────────────────────────────────────────────────────────────

async fn make_ctx() -> (
    tempfile::TempDir,
    Arc<MemoryCloudStore>,
    Arc<RecordingPlatform>,
    AppContext,
) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = DaemonConfig::with_data_dir(dir.path());
    config.ledger.persist_retry_delay_ms = 1;
    let cloud = Arc::new(MemoryCloudStore::new());
    let platform = Arc::new(RecordingPlatform::new());
    let ctx = AppContext::init_with_platform(config, cloud.clone(), platform.clone())
        .await
        .unwrap();
    (dir, cloud, platform, ctx)
}

// ─── Test 1: happy path ──────────────────────────────────────────────────────

#[tokio::test]
async fn purchase_credits_audits_and_finishes() {
    let (_dir, _cloud, platform, ctx) = make_ctx().await;
    ctx.ledger.sync().await.unwrap();

    ctx.purchases
        .handle("credits_medium", "txn-1", TransactionState::Purchased)
        .await
        .unwrap();

    assert_eq!(ctx.ledger.balance().await, 23);
    assert_eq!(platform.finished(), vec!["txn-1"]);

    let records = ctx.storage.list_purchase_records().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].product_id, "credits_medium");
    assert_eq!(records[0].credits_granted, 20);
    assert!(records[0].identity.starts_with("anonymous:"));
}

// ─── Test 2: exhausted retries ───────────────────────────────────────────────

#[tokio::test]
async fn exhausted_retries_still_finish_and_keep_the_grant() {
    let (_dir, cloud, platform, ctx) = make_ctx().await;

    // Authenticated identity with an existing document, then a dead cloud.
    cloud
        .insert_raw("user-1", json!({ "balance": 3, "rev": 1 }))
        .await;
    ctx.identity.link("user-1").await.unwrap();
    ctx.ledger.sync().await.unwrap();
    cloud.set_fail_writes(true);

    let result = ctx
        .purchases
        .handle("credits_medium", "txn-9", TransactionState::Purchased)
        .await;

    // The error surfaces to the caller…
    assert!(result.is_err());
    // …but the transaction is finished exactly once,
    assert_eq!(platform.finished(), vec!["txn-9"]);
    // the local grant is retained,
    assert_eq!(ctx.ledger.balance().await, 23);
    // the audit row was written once,
    assert_eq!(ctx.storage.count_purchase_records().await.unwrap(), 1);
    // and the cloud document still holds the old balance.
    assert_eq!(cloud.snapshot("user-1").await.unwrap().balance, 3);
}

// ─── Test 3: restored transactions ───────────────────────────────────────────

#[tokio::test]
async fn restored_transaction_credits_like_a_purchase() {
    let (_dir, _cloud, platform, ctx) = make_ctx().await;
    ctx.ledger.sync().await.unwrap();

    ctx.purchases
        .handle("credits_large", "txn-2", TransactionState::Restored)
        .await
        .unwrap();

    assert_eq!(ctx.ledger.balance().await, 103);
    assert_eq!(platform.finished(), vec!["txn-2"]);
}

// ─── Test 4: failed transactions ─────────────────────────────────────────────

#[tokio::test]
async fn failed_transaction_finishes_without_credit() {
    let (_dir, _cloud, platform, ctx) = make_ctx().await;
    ctx.ledger.sync().await.unwrap();

    ctx.purchases
        .handle("credits_small", "txn-3", TransactionState::Failed)
        .await
        .unwrap();

    assert_eq!(ctx.ledger.balance().await, 3);
    assert_eq!(platform.finished(), vec!["txn-3"]);
    assert_eq!(ctx.storage.count_purchase_records().await.unwrap(), 0);
}

#[tokio::test]
async fn deferred_transaction_is_left_pending() {
    let (_dir, _cloud, platform, ctx) = make_ctx().await;
    ctx.ledger.sync().await.unwrap();

    ctx.purchases
        .handle("credits_small", "txn-4", TransactionState::Deferred)
        .await
        .unwrap();

    assert_eq!(ctx.ledger.balance().await, 3);
    assert!(platform.finished().is_empty());
}

// ─── Test 5: unknown products ────────────────────────────────────────────────

#[tokio::test]
async fn unknown_product_finishes_without_credit() {
    let (_dir, _cloud, platform, ctx) = make_ctx().await;
    ctx.ledger.sync().await.unwrap();

    ctx.purchases
        .handle("credits_mystery", "txn-5", TransactionState::Purchased)
        .await
        .unwrap();

    assert_eq!(ctx.ledger.balance().await, 3);
    assert_eq!(platform.finished(), vec!["txn-5"]);
    assert_eq!(ctx.storage.count_purchase_records().await.unwrap(), 0);
}

// ─── Retry override ──────────────────────────────────────────────────────────

#[tokio::test]
async fn retry_override_controls_attempt_count() {
    // A processor with a single attempt fails faster but behaves the same.
    let dir = tempfile::tempdir().unwrap();
    let config = DaemonConfig::with_data_dir(dir.path());
    let cloud = Arc::new(MemoryCloudStore::new());
    let platform = Arc::new(RecordingPlatform::new());
    let ctx = AppContext::init_with_platform(config, cloud.clone(), platform.clone())
        .await
        .unwrap();

    cloud
        .insert_raw("user-1", json!({ "balance": 0, "rev": 1 }))
        .await;
    ctx.identity.link("user-1").await.unwrap();
    ctx.ledger.sync().await.unwrap();
    cloud.set_fail_writes(true);

    let processor = creditd::purchases::PurchaseProcessor::new(
        ctx.ledger.clone(),
        ctx.storage.clone(),
        ctx.identity.clone(),
        creditd::purchases::ProductCatalog::from_config(&ctx.config.products),
        platform.clone(),
        ctx.broadcaster.clone(),
    )
    .with_retry(RetryConfig::no_retry());

    let result = processor
        .handle("credits_small", "txn-6", TransactionState::Purchased)
        .await;
    assert!(result.is_err());
    assert_eq!(platform.finished(), vec!["txn-6"]);
}
