//! SDK callbacks as messages.
//!
//! The host app's platform callbacks (rewarded-ad completion, store
//! transaction observer, mission triggers, auth events) arrive here as
//! `{type, payload}` events on a single mpsc channel. The dispatcher task
//! owning the receiver is the only place ledger, mission, and purchase
//! mutations happen — the single-writer context that keeps the balance free
//! of lost updates without internal locking.

mod broadcaster;
pub use broadcaster::EventBroadcaster;

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::DaemonConfig;
use crate::identity::IdentityProvider;
use crate::ledger::{GrantSource, Ledger, LedgerError};
use crate::missions::{MissionBook, MissionKind};
use crate::purchases::{PurchaseProcessor, TransactionState};

// ─── Inbound events ───────────────────────────────────────────────────────────

/// One platform callback, serialized as `{"type": ..., "payload": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum SdkEvent {
    /// The user watched a rewarded ad to completion. No partial-credit
    /// signal exists; delivery is at-most-once per viewing.
    AdRewardEarned,
    /// The store reported a transaction state change.
    #[serde(rename_all = "camelCase")]
    PurchaseUpdated {
        product_id: String,
        transaction_id: String,
        state: TransactionState,
    },
    /// The host app observed a mission trigger (two-factor enabled, app
    /// rated, ...).
    MissionCompleted { kind: MissionKind },
    /// The user tapped "claim" on a mission.
    MissionClaimRequested { kind: MissionKind },
    /// The user started the generation flow; one credit is spent if any
    /// remain.
    GenerationRequested,
    /// A credential was attached to the anonymous identity.
    #[serde(rename_all = "camelCase")]
    AccountLinked { user_id: String },
    /// App came to the foreground: daily boundary, login mission, sync.
    AppOpened,
}

// ─── Dispatcher ───────────────────────────────────────────────────────────────

/// Owns the single event receiver and routes each event to the right
/// service. All credit mutations funnel through here.
pub struct EventDispatcher {
    config: DaemonConfig,
    ledger: Arc<Ledger>,
    missions: Arc<MissionBook>,
    purchases: Arc<PurchaseProcessor>,
    identity: Arc<IdentityProvider>,
    broadcaster: Arc<EventBroadcaster>,
}

impl EventDispatcher {
    pub fn new(
        config: DaemonConfig,
        ledger: Arc<Ledger>,
        missions: Arc<MissionBook>,
        purchases: Arc<PurchaseProcessor>,
        identity: Arc<IdentityProvider>,
        broadcaster: Arc<EventBroadcaster>,
    ) -> Self {
        Self {
            config,
            ledger,
            missions,
            purchases,
            identity,
            broadcaster,
        }
    }

    /// Consume events until the channel closes. Event failures are logged,
    /// never fatal — one bad event must not stall the loop.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<SdkEvent>) {
        while let Some(event) = rx.recv().await {
            if let Err(e) = self.dispatch(event).await {
                warn!(err = %e, "event handling failed");
            }
        }
        info!("event channel closed — dispatcher stopping");
    }

    pub async fn dispatch(&self, event: SdkEvent) -> Result<()> {
        match event {
            SdkEvent::AdRewardEarned => {
                self.ledger
                    .grant(self.config.ledger.ad_reward_credits, GrantSource::AdReward)
                    .await;
                if let Err(e) = self.ledger.persist().await {
                    warn!(err = %e, "balance persist failed after ad reward");
                }
                Ok(())
            }

            SdkEvent::PurchaseUpdated {
                product_id,
                transaction_id,
                state,
            } => {
                // The processor has already finished the transaction and
                // broadcast the failure by the time an error surfaces.
                if let Err(e) = self
                    .purchases
                    .handle(&product_id, &transaction_id, state)
                    .await
                {
                    warn!(product_id, err = %e, "purchase credited locally but cloud persist failed");
                }
                Ok(())
            }

            SdkEvent::MissionCompleted { kind } => {
                self.missions.complete(kind).await?;
                Ok(())
            }

            SdkEvent::MissionClaimRequested { kind } => {
                // A claim on an ineligible mission is a guarded no-op.
                self.missions.claim(kind).await?;
                Ok(())
            }

            SdkEvent::GenerationRequested => {
                match self.ledger.consume(1).await {
                    Ok(remaining) => {
                        if let Err(e) = self.ledger.persist().await {
                            warn!(err = %e, "balance persist failed after consumption");
                        }
                        self.broadcaster.broadcast(
                            "generation.approved",
                            json!({ "remaining": remaining }),
                        );
                    }
                    Err(LedgerError::InsufficientCredits { balance }) => {
                        self.broadcaster.broadcast(
                            "generation.denied",
                            json!({
                                "reason": "insufficient_credits",
                                "balance": balance,
                                "message": "Out of credits — watch an ad or purchase a pack to continue.",
                            }),
                        );
                    }
                }
                Ok(())
            }

            SdkEvent::AccountLinked { user_id } => {
                self.identity.link(&user_id).await?;
                let prior = self.ledger.transfer_anonymous_to_authenticated().await?;

                // A pre-existing account brings its mission flags with it;
                // reconcile before recording the link mission so the claim
                // state from another device is not clobbered.
                if let Some(prior) = prior {
                    self.missions.reconcile(&prior.missions).await?;
                }
                self.missions.complete(MissionKind::AccountLink).await?;
                if let Err(e) = self
                    .ledger
                    .persist_missions(self.missions.flags().await)
                    .await
                {
                    warn!(err = %e, "mission flags persist failed after linking");
                }

                self.broadcaster
                    .broadcast("identity.linked", json!({ "userId": user_id }));
                Ok(())
            }

            SdkEvent::AppOpened => {
                self.missions.apply_daily_reset().await?;
                self.missions.complete(MissionKind::DailyLogin).await?;

                match self.ledger.sync().await {
                    Ok(Some(snapshot)) => {
                        self.missions.reconcile(&snapshot.missions).await?;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        // Stale-but-available: the in-memory balance stays.
                        warn!(err = %e, "cloud sync failed — continuing with last known balance");
                        self.broadcaster.broadcast(
                            "sync.failed",
                            json!({ "reason": "app_open_sync", "error": e.to_string() }),
                        );
                    }
                }
                Ok(())
            }
        }
    }
}
