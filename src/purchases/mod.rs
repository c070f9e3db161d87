//! Purchase crediting — turn a confirmed store transaction into a ledger
//! grant exactly once.
//!
//! For `purchased`/`restored` transactions the processor grants the
//! product's credits, persists to the cloud with a bounded fixed-delay
//! retry, appends one audit row, and only then finishes the platform
//! transaction. Exhausted retries still finish the transaction and keep the
//! grant — the failure mode favors never re-charging the user over strict
//! cloud consistency.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::config::ProductConfig;
use crate::events::EventBroadcaster;
use crate::identity::IdentityProvider;
use crate::ledger::{GrantSource, Ledger};
use crate::retry::{retry_fixed, RetryConfig};
use crate::storage::Storage;

// ─── Types ────────────────────────────────────────────────────────────────────

/// Store transaction states the platform reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransactionState {
    Purchased,
    Restored,
    Failed,
    Deferred,
}

/// Product id → credits granted. Built from config at startup.
#[derive(Debug, Clone, Default)]
pub struct ProductCatalog {
    credits: HashMap<String, i64>,
}

impl ProductCatalog {
    pub fn from_config(products: &[ProductConfig]) -> Self {
        Self {
            credits: products
                .iter()
                .map(|p| (p.id.clone(), p.credits))
                .collect(),
        }
    }

    pub fn credits_for(&self, product_id: &str) -> Option<i64> {
        self.credits.get(product_id).copied()
    }
}

/// The store platform's acknowledgement surface. Each transaction must be
/// finished exactly once or the store re-delivers it forever.
#[async_trait]
pub trait PurchasePlatform: Send + Sync {
    async fn finish(&self, transaction_id: &str) -> Result<()>;
}

/// Production implementation for sidecar mode: finishing a transaction means
/// telling the host app to acknowledge it with the store.
pub struct BroadcastPlatform {
    broadcaster: Arc<EventBroadcaster>,
}

impl BroadcastPlatform {
    pub fn new(broadcaster: Arc<EventBroadcaster>) -> Self {
        Self { broadcaster }
    }
}

#[async_trait]
impl PurchasePlatform for BroadcastPlatform {
    async fn finish(&self, transaction_id: &str) -> Result<()> {
        self.broadcaster
            .broadcast("purchase.finish", json!({ "transactionId": transaction_id }));
        Ok(())
    }
}

/// Test double — records every finished transaction id.
#[derive(Default)]
pub struct RecordingPlatform {
    finished: std::sync::Mutex<Vec<String>>,
}

impl RecordingPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finished(&self) -> Vec<String> {
        self.finished.lock().expect("platform mutex poisoned").clone()
    }
}

#[async_trait]
impl PurchasePlatform for RecordingPlatform {
    async fn finish(&self, transaction_id: &str) -> Result<()> {
        self.finished
            .lock()
            .expect("platform mutex poisoned")
            .push(transaction_id.to_string());
        Ok(())
    }
}

// ─── Processor ────────────────────────────────────────────────────────────────

pub struct PurchaseProcessor {
    ledger: Arc<Ledger>,
    storage: Arc<Storage>,
    identity: Arc<IdentityProvider>,
    catalog: ProductCatalog,
    platform: Arc<dyn PurchasePlatform>,
    broadcaster: Arc<EventBroadcaster>,
    retry: RetryConfig,
}

impl PurchaseProcessor {
    pub fn new(
        ledger: Arc<Ledger>,
        storage: Arc<Storage>,
        identity: Arc<IdentityProvider>,
        catalog: ProductCatalog,
        platform: Arc<dyn PurchasePlatform>,
        broadcaster: Arc<EventBroadcaster>,
    ) -> Self {
        let cfg = ledger.config();
        let retry = RetryConfig::fixed(
            cfg.persist_retry_attempts,
            Duration::from_millis(cfg.persist_retry_delay_ms),
        );
        Self {
            ledger,
            storage,
            identity,
            catalog,
            platform,
            broadcaster,
            retry,
        }
    }

    /// Override the retry policy (tests use [`RetryConfig::instant`]).
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Handle one transaction-state-changed event from the store.
    ///
    /// Returns an error only when cloud persistence exhausted its retries —
    /// by that point the grant is applied, the audit row attempted, and the
    /// transaction finished; the error is for the UI layer.
    pub async fn handle(
        &self,
        product_id: &str,
        transaction_id: &str,
        state: TransactionState,
    ) -> Result<()> {
        match state {
            TransactionState::Deferred => {
                info!(product_id, transaction_id, "purchase deferred — waiting");
                return Ok(());
            }
            TransactionState::Failed => {
                info!(product_id, transaction_id, "purchase failed — finishing");
                self.finish(transaction_id).await;
                return Ok(());
            }
            TransactionState::Purchased | TransactionState::Restored => {}
        }

        let Some(credits) = self.catalog.credits_for(product_id) else {
            warn!(product_id, transaction_id, "unknown product — finishing without credit");
            self.finish(transaction_id).await;
            return Ok(());
        };

        let balance = self.ledger.grant(credits, GrantSource::Purchase).await;

        let persist_result = retry_fixed(&self.retry, || self.ledger.persist()).await;

        // Audit row — attempted once; a failure is logged, never retried.
        let identity = self.identity.current().await.audit_label();
        if let Err(e) = self
            .storage
            .append_purchase_record(&identity, product_id, credits)
            .await
        {
            warn!(product_id, transaction_id, err = %e, "purchase audit write failed");
        }

        // Finish exactly once, even when persistence failed — the user paid.
        self.finish(transaction_id).await;

        self.broadcaster.broadcast(
            "purchase.credited",
            json!({
                "productId": product_id,
                "credits": credits,
                "balance": balance,
            }),
        );

        if let Err(e) = persist_result {
            self.broadcaster.broadcast(
                "sync.failed",
                json!({ "reason": "purchase_persist", "error": e.to_string() }),
            );
            return Err(e);
        }
        Ok(())
    }

    async fn finish(&self, transaction_id: &str) {
        if let Err(e) = self.platform.finish(transaction_id).await {
            warn!(transaction_id, err = %e, "platform transaction finish failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_lookup() {
        let catalog = ProductCatalog::from_config(&[
            ProductConfig { id: "credits_small".to_string(), credits: 5 },
            ProductConfig { id: "credits_large".to_string(), credits: 100 },
        ]);
        assert_eq!(catalog.credits_for("credits_small"), Some(5));
        assert_eq!(catalog.credits_for("credits_large"), Some(100));
        assert_eq!(catalog.credits_for("credits_unknown"), None);
    }

    #[test]
    fn transaction_state_wire_names() {
        let s: TransactionState = serde_json::from_str("\"purchased\"").unwrap();
        assert_eq!(s, TransactionState::Purchased);
        assert_eq!(
            serde_json::to_string(&TransactionState::Restored).unwrap(),
            "\"restored\""
        );
    }
}
