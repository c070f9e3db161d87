//! Entitlement ledger — the authoritative in-memory credit counter.
//!
//! One balance exists per process, owned by the current identity. Anonymous
//! balances live in the local `settings` table as an HMAC-tagged record
//! (keyed by the device key, so a hand-edited count fails verification and
//! falls back to the default). Authenticated balances live in the per-user
//! cloud document and are written with a revision guard.
//!
//! The ledger performs no cross-task locking of its own: all mutations are
//! marshaled through the single event-dispatcher context. The interior
//! mutex exists for Rust, not for coordination.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::Sha256;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::cloud::{CloudError, CloudSnapshot, CloudStore, SnapshotPatch};
use crate::config::LedgerConfig;
use crate::events::EventBroadcaster;
use crate::identity::{self, Identity, IdentityProvider};
use crate::missions::MissionFlags;
use crate::storage::Storage;

const ANON_BALANCE_SETTING: &str = "anonymous.balance";
const FAVORITES_SETTING: &str = "favorites";

type HmacSha256 = Hmac<Sha256>;

// ─── Types ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum LedgerError {
    /// The generation flow was invoked without enough credits. A guarded,
    /// user-facing condition — not a crash.
    #[error("insufficient credits (balance {balance})")]
    InsufficientCredits { balance: i64 },
}

/// Where a credit grant came from. The ledger trusts each caller to deliver
/// its real-world event at most once; no idempotency is enforced here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantSource {
    AdReward,
    Purchase,
    MissionReward,
}

impl GrantSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantSource::AdReward => "ad_reward",
            GrantSource::Purchase => "purchase",
            GrantSource::MissionReward => "mission_reward",
        }
    }
}

/// On-disk form of the anonymous balance.
#[derive(Serialize, Deserialize)]
struct LocalBalanceRecord {
    balance: i64,
    /// HMAC-SHA256 over the decimal balance, keyed by the device key.
    tag: String,
}

#[derive(Default)]
struct LedgerState {
    balance: i64,
    favorites: Vec<String>,
    /// Last cloud document revision this process observed.
    cloud_rev: u64,
}

// ─── Ledger ───────────────────────────────────────────────────────────────────

pub struct Ledger {
    config: LedgerConfig,
    storage: Arc<Storage>,
    cloud: Arc<dyn CloudStore>,
    identity: Arc<IdentityProvider>,
    broadcaster: Arc<EventBroadcaster>,
    state: Mutex<LedgerState>,
}

impl Ledger {
    pub fn new(
        config: LedgerConfig,
        storage: Arc<Storage>,
        cloud: Arc<dyn CloudStore>,
        identity: Arc<IdentityProvider>,
        broadcaster: Arc<EventBroadcaster>,
    ) -> Self {
        Self {
            config,
            storage,
            cloud,
            identity,
            broadcaster,
            state: Mutex::new(LedgerState::default()),
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub async fn balance(&self) -> i64 {
        self.state.lock().await.balance
    }

    pub async fn favorites(&self) -> Vec<String> {
        self.state.lock().await.favorites.clone()
    }

    // ─── sync ───────────────────────────────────────────────────────────────

    /// Load the balance for the current identity.
    ///
    /// Anonymous: reads the local record, initializing to the default when
    /// absent or tampered — never fails. Authenticated: fetches the cloud
    /// document, creating it with the default balance on first login; a
    /// fetch failure is surfaced and the in-memory balance stays whatever it
    /// was (stale-but-available). Returns the cloud snapshot for
    /// authenticated identities so callers can reconcile mission flags.
    pub async fn sync(&self) -> Result<Option<CloudSnapshot>> {
        match self.identity.current().await {
            Identity::Anonymous { .. } => {
                let balance = match self.read_local_balance().await {
                    Ok(Some(balance)) => balance,
                    Ok(None) => {
                        let balance = self.config.default_balance;
                        if let Err(e) = self.write_local_balance(balance).await {
                            warn!(err = %e, "could not seed anonymous balance record");
                        }
                        balance
                    }
                    Err(e) => {
                        warn!(err = %e, "local balance read failed — using default");
                        self.config.default_balance
                    }
                };
                let favorites = self.read_local_favorites().await;
                let mut state = self.state.lock().await;
                state.balance = balance;
                state.favorites = favorites;
                Ok(None)
            }
            Identity::Authenticated { user_id } => {
                match self.cloud.get(&user_id).await {
                    Ok(Some(snapshot)) => {
                        {
                            let mut state = self.state.lock().await;
                            state.balance = snapshot.balance;
                            state.favorites = snapshot.favorites.clone();
                            state.cloud_rev = snapshot.rev;
                        }
                        // Cloud favorites win over any local copy.
                        self.write_local_favorites(&snapshot.favorites).await;
                        Ok(Some(snapshot))
                    }
                    Ok(None) => Ok(Some(self.create_default_document(&user_id).await?)),
                    Err(CloudError::Decode(e)) => {
                        // Faithful to the source system: a document that no
                        // longer decodes is recreated with the default
                        // balance, which can discard a real balance.
                        warn!(
                            user_id = %user_id,
                            err = %e,
                            "entitlement document is malformed — recreating with default balance"
                        );
                        Ok(Some(self.create_default_document(&user_id).await?))
                    }
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    async fn create_default_document(&self, user_id: &str) -> Result<CloudSnapshot> {
        let favorites = self.read_local_favorites().await;
        let snapshot = CloudSnapshot {
            balance: self.config.default_balance,
            favorites,
            missions: BTreeMap::new(),
            last_sync: Some(Utc::now().to_rfc3339()),
            rev: 1,
        };
        self.cloud.create(user_id, &snapshot).await?;
        let mut state = self.state.lock().await;
        state.balance = snapshot.balance;
        state.favorites = snapshot.favorites.clone();
        state.cloud_rev = snapshot.rev;
        info!(user_id, balance = snapshot.balance, "created entitlement document");
        Ok(snapshot)
    }

    // ─── mutation ───────────────────────────────────────────────────────────

    /// Spend `n` credits. The generation flow checks the balance before
    /// calling; this re-check turns a racing caller into a user-facing
    /// error instead of a negative balance.
    pub async fn consume(&self, n: i64) -> Result<i64, LedgerError> {
        let mut state = self.state.lock().await;
        if state.balance < n || state.balance <= 0 {
            return Err(LedgerError::InsufficientCredits {
                balance: state.balance,
            });
        }
        state.balance -= n;
        let balance = state.balance;
        drop(state);
        self.broadcaster
            .broadcast("balance.changed", json!({ "balance": balance }));
        Ok(balance)
    }

    /// Add `amount` credits. Returns the new balance.
    pub async fn grant(&self, amount: i64, source: GrantSource) -> i64 {
        let balance = {
            let mut state = self.state.lock().await;
            state.balance += amount;
            state.balance
        };
        info!(amount, source = source.as_str(), balance, "credits granted");
        self.broadcaster.broadcast(
            "balance.changed",
            json!({ "balance": balance, "source": source.as_str() }),
        );
        balance
    }

    // ─── persistence ────────────────────────────────────────────────────────

    /// Write the in-memory balance to the store matching the identity kind.
    /// Single attempt; the purchase-crediting path wraps this in its own
    /// bounded retry.
    pub async fn persist(&self) -> Result<()> {
        match self.identity.current().await {
            Identity::Anonymous { .. } => {
                let balance = self.state.lock().await.balance;
                self.write_local_balance(balance).await
            }
            Identity::Authenticated { user_id } => {
                let now = Utc::now().to_rfc3339();
                self.apply_merge(&user_id, |state| SnapshotPatch {
                    balance: Some(state.balance),
                    last_sync: Some(now.clone()),
                    expected_rev: state.cloud_rev,
                    ..Default::default()
                })
                .await
            }
        }
    }

    /// Mirror mission flags into the cloud document. A no-op for anonymous
    /// identities — their mission book lives only on the device.
    pub async fn persist_missions(
        &self,
        flags: BTreeMap<String, MissionFlags>,
    ) -> Result<()> {
        let Some(user_id) = self.identity.user_id().await else {
            return Ok(());
        };
        let now = Utc::now().to_rfc3339();
        self.apply_merge(&user_id, |state| SnapshotPatch {
            missions: Some(flags.clone()),
            last_sync: Some(now.clone()),
            expected_rev: state.cloud_rev,
            ..Default::default()
        })
        .await
    }

    /// Rev-guarded merge. When the document has moved past the revision this
    /// process last saw, refresh the revision once and rewrite — the local
    /// value stays authoritative for this write, but never lands on an
    /// unseen revision silently.
    async fn apply_merge<F>(&self, user_id: &str, build: F) -> Result<()>
    where
        F: Fn(&LedgerState) -> SnapshotPatch,
    {
        for attempt in 0..2 {
            let patch = {
                let state = self.state.lock().await;
                build(&state)
            };
            match self.cloud.set_merge(user_id, &patch).await {
                Ok(rev) => {
                    self.state.lock().await.cloud_rev = rev;
                    return Ok(());
                }
                Err(CloudError::StaleWrite { actual, .. }) if attempt == 0 => {
                    warn!(actual, "cloud document moved — refreshing revision and rewriting");
                    self.state.lock().await.cloud_rev = actual;
                }
                Err(e) => return Err(e.into()),
            }
        }
        bail!("cloud merge failed after revision refresh")
    }

    // ─── account linking ────────────────────────────────────────────────────

    /// Move the anonymous balance into the (just-linked) authenticated
    /// account: overwrite the in-memory balance with the anonymous value,
    /// delete the anonymous record, persist to the cloud. A pre-existing
    /// cloud balance is discarded, not summed. Returns the prior cloud
    /// snapshot, if one existed, so mission flags can be reconciled.
    pub async fn transfer_anonymous_to_authenticated(
        &self,
    ) -> Result<Option<CloudSnapshot>> {
        let Some(user_id) = self.identity.user_id().await else {
            bail!("account must be linked before the balance transfer");
        };

        let anon_balance = self
            .read_local_balance()
            .await?
            .unwrap_or(self.config.default_balance);

        let prior = match self.cloud.get(&user_id).await {
            Ok(prior) => prior,
            Err(CloudError::Decode(e)) => {
                warn!(err = %e, "existing entitlement document is malformed — it will be recreated");
                None
            }
            Err(e) => return Err(e.into()),
        };

        {
            let mut state = self.state.lock().await;
            state.balance = anon_balance;
            state.cloud_rev = prior.as_ref().map(|p| p.rev).unwrap_or(0);
        }
        self.storage.delete_setting(ANON_BALANCE_SETTING).await?;

        let now = Utc::now().to_rfc3339();
        match &prior {
            Some(existing) => {
                if existing.balance != anon_balance {
                    info!(
                        cloud_balance = existing.balance,
                        transferred = anon_balance,
                        "overwriting pre-existing cloud balance with device balance"
                    );
                }
                self.apply_merge(&user_id, |state| SnapshotPatch {
                    balance: Some(state.balance),
                    last_sync: Some(now.clone()),
                    expected_rev: state.cloud_rev,
                    ..Default::default()
                })
                .await?;
            }
            None => {
                let favorites = self.read_local_favorites().await;
                let snapshot = CloudSnapshot {
                    balance: anon_balance,
                    favorites: favorites.clone(),
                    missions: BTreeMap::new(),
                    last_sync: Some(now),
                    rev: 1,
                };
                self.cloud.create(&user_id, &snapshot).await?;
                let mut state = self.state.lock().await;
                state.favorites = favorites;
                state.cloud_rev = 1;
            }
        }

        self.broadcaster.broadcast(
            "balance.changed",
            json!({ "balance": anon_balance, "reason": "account_link_transfer" }),
        );
        info!(user_id, balance = anon_balance, "anonymous balance transferred");
        Ok(prior)
    }

    // ─── favorites ──────────────────────────────────────────────────────────

    /// Returns false when the name was already a favorite.
    pub async fn add_favorite(&self, name: &str) -> Result<bool> {
        let favorites = {
            let mut state = self.state.lock().await;
            if state.favorites.iter().any(|f| f == name) {
                return Ok(false);
            }
            state.favorites.push(name.to_string());
            state.favorites.clone()
        };
        self.write_local_favorites(&favorites).await;
        self.push_favorites_to_cloud().await;
        Ok(true)
    }

    /// Returns false when the name was not a favorite.
    pub async fn remove_favorite(&self, name: &str) -> Result<bool> {
        let favorites = {
            let mut state = self.state.lock().await;
            let before = state.favorites.len();
            state.favorites.retain(|f| f != name);
            if state.favorites.len() == before {
                return Ok(false);
            }
            state.favorites.clone()
        };
        self.write_local_favorites(&favorites).await;
        self.push_favorites_to_cloud().await;
        Ok(true)
    }

    async fn push_favorites_to_cloud(&self) {
        let Some(user_id) = self.identity.user_id().await else {
            return;
        };
        let now = Utc::now().to_rfc3339();
        let result = self
            .apply_merge(&user_id, |state| SnapshotPatch {
                favorites: Some(state.favorites.clone()),
                last_sync: Some(now.clone()),
                expected_rev: state.cloud_rev,
                ..Default::default()
            })
            .await;
        if let Err(e) = result {
            warn!(err = %e, "favorites cloud persist failed");
        }
    }

    // ─── local records ──────────────────────────────────────────────────────

    async fn read_local_balance(&self) -> Result<Option<i64>> {
        let Some(raw) = self.storage.get_setting(ANON_BALANCE_SETTING).await? else {
            return Ok(None);
        };
        let record: LocalBalanceRecord = match serde_json::from_str(&raw) {
            Ok(record) => record,
            Err(e) => {
                warn!(err = %e, "anonymous balance record is malformed — treating as absent");
                return Ok(None);
            }
        };
        let device_key = identity::device_key(&self.storage).await?;
        if !verify_balance_tag(&device_key, record.balance, &record.tag) {
            warn!("anonymous balance record failed integrity check — treating as absent");
            return Ok(None);
        }
        Ok(Some(record.balance))
    }

    async fn write_local_balance(&self, balance: i64) -> Result<()> {
        let device_key = identity::device_key(&self.storage).await?;
        let record = LocalBalanceRecord {
            balance,
            tag: sign_balance(&device_key, balance),
        };
        self.storage
            .set_setting(ANON_BALANCE_SETTING, &serde_json::to_string(&record)?)
            .await
    }

    async fn read_local_favorites(&self) -> Vec<String> {
        match self.storage.get_setting(FAVORITES_SETTING).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    async fn write_local_favorites(&self, favorites: &[String]) {
        let raw = match serde_json::to_string(favorites) {
            Ok(raw) => raw,
            Err(_) => return,
        };
        if let Err(e) = self.storage.set_setting(FAVORITES_SETTING, &raw).await {
            warn!(err = %e, "favorites local write failed");
        }
    }
}

// ─── Integrity tag ────────────────────────────────────────────────────────────

fn sign_balance(device_key: &str, balance: i64) -> String {
    let mut mac = HmacSha256::new_from_slice(device_key.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(balance.to_string().as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn verify_balance_tag(device_key: &str, balance: i64, tag: &str) -> bool {
    let Ok(tag_bytes) = hex::decode(tag) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(device_key.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(balance.to_string().as_bytes());
    mac.verify_slice(&tag_bytes).is_ok()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balance_tag_roundtrip() {
        let tag = sign_balance("device-key", 7);
        assert!(verify_balance_tag("device-key", 7, &tag));
    }

    #[test]
    fn tampered_balance_fails_verification() {
        let tag = sign_balance("device-key", 7);
        assert!(!verify_balance_tag("device-key", 100, &tag));
        assert!(!verify_balance_tag("other-key", 7, &tag));
        assert!(!verify_balance_tag("device-key", 7, "zz-not-hex"));
    }

    #[test]
    fn grant_sources_have_stable_names() {
        assert_eq!(GrantSource::AdReward.as_str(), "ad_reward");
        assert_eq!(GrantSource::Purchase.as_str(), "purchase");
        assert_eq!(GrantSource::MissionReward.as_str(), "mission_reward");
    }
}
