//! End-to-end tests driving the daemon through SDK events, the way the host
//! app does in sidecar mode.

use std::sync::Arc;

use serde_json::json;

use creditd::cloud::MemoryCloudStore;
use creditd::config::DaemonConfig;
use creditd::events::SdkEvent;
use creditd::missions::MissionKind;
use creditd::purchases::{RecordingPlatform, TransactionState};
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

/// Drain everything currently sitting in the broadcast channel.
fn drain(rx: &mut tokio::sync::broadcast::Receiver<String>) -> Vec<serde_json::Value> {
    let mut out = Vec::new();
    while let Ok(line) = rx.try_recv() {
        out.push(serde_json::from_str(&line).unwrap());
    }
    out
}

// ─── App open ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn app_open_seeds_balance_and_completes_daily_login() {
    let (_dir, _cloud, _platform, ctx) = make_ctx().await;
    let dispatcher = ctx.dispatcher();

    dispatcher.dispatch(SdkEvent::AppOpened).await.unwrap();

    assert_eq!(ctx.ledger.balance().await, 3);
    let daily = ctx.missions.get(MissionKind::DailyLogin).await;
    assert!(daily.completed);
    assert!(!daily.reward_claimed);
}

// ─── Ad rewards ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn ad_reward_event_grants_and_persists() {
    let dir = tempfile::tempdir().unwrap();
    {
        let config = DaemonConfig::with_data_dir(dir.path());
        let cloud = Arc::new(MemoryCloudStore::new());
        let ctx = AppContext::init(config, cloud).await.unwrap();
        let dispatcher = ctx.dispatcher();

        dispatcher.dispatch(SdkEvent::AppOpened).await.unwrap();
        dispatcher.dispatch(SdkEvent::AdRewardEarned).await.unwrap();
        assert_eq!(ctx.ledger.balance().await, 6);
    }

    // The grant reached the local record: a fresh context sees it.
    let config = DaemonConfig::with_data_dir(dir.path());
    let cloud = Arc::new(MemoryCloudStore::new());
    let ctx = AppContext::init(config, cloud).await.unwrap();
    ctx.ledger.sync().await.unwrap();
    assert_eq!(ctx.ledger.balance().await, 6);
}

// ─── Generation flow ─────────────────────────────────────────────────────────

#[tokio::test]
async fn generation_is_denied_at_zero_balance() {
    let (_dir, _cloud, _platform, ctx) = make_ctx().await;
    let dispatcher = ctx.dispatcher();
    let mut rx = ctx.broadcaster.subscribe();

    dispatcher.dispatch(SdkEvent::AppOpened).await.unwrap();
    for _ in 0..3 {
        dispatcher
            .dispatch(SdkEvent::GenerationRequested)
            .await
            .unwrap();
    }
    assert_eq!(ctx.ledger.balance().await, 0);

    let _ = drain(&mut rx);
    dispatcher
        .dispatch(SdkEvent::GenerationRequested)
        .await
        .unwrap();

    let events = drain(&mut rx);
    let denied = events
        .iter()
        .find(|e| e["type"] == "generation.denied")
        .expect("expected a generation.denied notification");
    assert_eq!(denied["payload"]["reason"], "insufficient_credits");
    assert_eq!(ctx.ledger.balance().await, 0);
}

#[tokio::test]
async fn generation_consumes_one_credit() {
    let (_dir, _cloud, _platform, ctx) = make_ctx().await;
    let dispatcher = ctx.dispatcher();
    let mut rx = ctx.broadcaster.subscribe();

    dispatcher.dispatch(SdkEvent::AppOpened).await.unwrap();
    let _ = drain(&mut rx);

    dispatcher
        .dispatch(SdkEvent::GenerationRequested)
        .await
        .unwrap();

    let events = drain(&mut rx);
    let approved = events
        .iter()
        .find(|e| e["type"] == "generation.approved")
        .expect("expected a generation.approved notification");
    assert_eq!(approved["payload"]["remaining"], 2);
}

// ─── Mission claim over events ───────────────────────────────────────────────

#[tokio::test]
async fn mission_claim_event_grants_reward() {
    let (_dir, _cloud, _platform, ctx) = make_ctx().await;
    let dispatcher = ctx.dispatcher();

    dispatcher.dispatch(SdkEvent::AppOpened).await.unwrap();
    dispatcher
        .dispatch(SdkEvent::MissionClaimRequested {
            kind: MissionKind::DailyLogin,
        })
        .await
        .unwrap();

    assert_eq!(ctx.ledger.balance().await, 6);

    // Claiming again the same day is silently guarded.
    dispatcher
        .dispatch(SdkEvent::MissionClaimRequested {
            kind: MissionKind::DailyLogin,
        })
        .await
        .unwrap();
    assert_eq!(ctx.ledger.balance().await, 6);
}

// ─── Account linking ─────────────────────────────────────────────────────────

#[tokio::test]
async fn account_link_transfers_and_completes_mission() {
    let (_dir, cloud, _platform, ctx) = make_ctx().await;
    let dispatcher = ctx.dispatcher();

    dispatcher.dispatch(SdkEvent::AppOpened).await.unwrap();
    dispatcher.dispatch(SdkEvent::AdRewardEarned).await.unwrap();
    dispatcher
        .dispatch(SdkEvent::GenerationRequested)
        .await
        .unwrap();
    assert_eq!(ctx.ledger.balance().await, 5);

    // The target account already holds 10 credits from another device.
    cloud
        .insert_raw("user-7", json!({ "balance": 10, "rev": 2 }))
        .await;

    dispatcher
        .dispatch(SdkEvent::AccountLinked {
            user_id: "user-7".to_string(),
        })
        .await
        .unwrap();

    // Overwrite semantics: 5, not 15, not 10.
    assert_eq!(ctx.ledger.balance().await, 5);
    assert_eq!(cloud.snapshot("user-7").await.unwrap().balance, 5);

    // The link mission completed and its flags were pushed to the cloud.
    let link = ctx.missions.get(MissionKind::AccountLink).await;
    assert!(link.completed);
    let doc = cloud.snapshot("user-7").await.unwrap();
    assert!(doc.missions.get("account_link").unwrap().completed);
}

#[tokio::test]
async fn purchase_event_flows_through_dispatcher() {
    let (_dir, _cloud, platform, ctx) = make_ctx().await;
    let dispatcher = ctx.dispatcher();

    dispatcher.dispatch(SdkEvent::AppOpened).await.unwrap();
    dispatcher
        .dispatch(SdkEvent::PurchaseUpdated {
            product_id: "credits_small".to_string(),
            transaction_id: "txn-d1".to_string(),
            state: TransactionState::Purchased,
        })
        .await
        .unwrap();

    assert_eq!(ctx.ledger.balance().await, 8);
    assert_eq!(platform.finished(), vec!["txn-d1"]);
}
