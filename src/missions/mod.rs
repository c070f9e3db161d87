//! Mission reward state machine.
//!
//! Each mission moves `Incomplete → Completed(unclaimed) → Completed(claimed)`.
//! Claiming grants bonus credits through the ledger. The daily-login mission
//! is recurring: its claimed flag (and only that flag) resets at local
//! midnight in Asia/Taipei civil time, regardless of the device timezone.
//! The reset is durable across devices because a server-recorded claim only
//! counts as "claimed today" when its Asia/Taipei calendar date equals the
//! current one.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Asia::Taipei;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::MissionConfig;
use crate::events::EventBroadcaster;
use crate::ledger::{GrantSource, Ledger};
use crate::storage::Storage;

const MISSIONS_SETTING: &str = "missions";

// ─── Types ────────────────────────────────────────────────────────────────────

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum MissionKind {
    DailyLogin,
    TwoFactorAuth,
    AccountLink,
    AppRating,
}

impl MissionKind {
    pub fn all() -> [MissionKind; 4] {
        [
            MissionKind::DailyLogin,
            MissionKind::TwoFactorAuth,
            MissionKind::AccountLink,
            MissionKind::AppRating,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            MissionKind::DailyLogin => "daily_login",
            MissionKind::TwoFactorAuth => "two_factor_auth",
            MissionKind::AccountLink => "account_link",
            MissionKind::AppRating => "app_rating",
        }
    }

    pub fn from_name(name: &str) -> Option<MissionKind> {
        MissionKind::all().into_iter().find(|k| k.name() == name)
    }

    /// Only the daily-login mission recurs; the rest are one-time.
    pub fn is_recurring(&self) -> bool {
        matches!(self, MissionKind::DailyLogin)
    }
}

/// Local per-mission record.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct MissionState {
    pub completed: bool,
    pub reward_claimed: bool,
    /// Credits granted on claim. Comes from config, not from the server.
    pub reward_amount: i64,
    pub claimed_at: Option<DateTime<Utc>>,
}

/// Wire form of a mission record inside the cloud document. Amounts stay
/// local; only flags and the claim timestamp travel.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct MissionFlags {
    pub completed: bool,
    pub reward_claimed: bool,
    pub claimed_at: Option<DateTime<Utc>>,
}

fn taipei_date(ts: DateTime<Utc>) -> NaiveDate {
    ts.with_timezone(&Taipei).date_naive()
}

/// A claim timestamp counts as "today" only on the Asia/Taipei calendar.
fn claimed_today(claimed_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match claimed_at {
        Some(ts) => taipei_date(ts) == taipei_date(now),
        None => false,
    }
}

// ─── MissionBook ──────────────────────────────────────────────────────────────

/// All mission state for the current identity, persisted as one JSON blob in
/// the `settings` table and mirrored into the cloud document when
/// authenticated.
pub struct MissionBook {
    config: MissionConfig,
    storage: Arc<Storage>,
    ledger: Arc<Ledger>,
    broadcaster: Arc<EventBroadcaster>,
    state: Mutex<BTreeMap<MissionKind, MissionState>>,
}

impl MissionBook {
    /// Load the book from local storage, filling in any missions added since
    /// the blob was written, then apply the daily boundary.
    pub async fn load(
        config: MissionConfig,
        storage: Arc<Storage>,
        ledger: Arc<Ledger>,
        broadcaster: Arc<EventBroadcaster>,
    ) -> Result<Self> {
        let mut book: BTreeMap<MissionKind, MissionState> =
            match storage.get_setting(MISSIONS_SETTING).await? {
                Some(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                    warn!(err = %e, "stored mission book is malformed — starting fresh");
                    BTreeMap::new()
                }),
                None => BTreeMap::new(),
            };

        for kind in MissionKind::all() {
            let reward = reward_for(&config, kind);
            let entry = book.entry(kind).or_default();
            // Reward amounts follow config, not whatever was stored.
            entry.reward_amount = reward;
        }

        let missions = Self {
            config,
            storage,
            ledger,
            broadcaster,
            state: Mutex::new(book),
        };
        missions.apply_daily_reset().await?;
        Ok(missions)
    }

    /// `Incomplete → Completed(unclaimed)`. Idempotent: completing an
    /// already-completed mission is a no-op. Returns whether a transition
    /// happened.
    pub async fn complete(&self, kind: MissionKind) -> Result<bool> {
        let snapshot = {
            let mut book = self.state.lock().await;
            let entry = book.entry(kind).or_default();
            if entry.completed {
                return Ok(false);
            }
            entry.completed = true;
            serde_json::to_string(&*book)?
        };
        self.save_local(&snapshot).await?;
        info!(mission = kind.name(), "mission completed");
        self.broadcast_updated(kind).await;
        Ok(true)
    }

    /// `Completed(unclaimed) → Completed(claimed)`; grants the reward through
    /// the ledger and persists once (best-effort). A claim on an ineligible
    /// mission is a guarded no-op — `Ok(None)`, no state change, no grant.
    pub async fn claim(&self, kind: MissionKind) -> Result<Option<i64>> {
        self.apply_daily_reset().await?;

        let now = Utc::now();
        let (amount, snapshot, flags) = {
            let mut book = self.state.lock().await;
            let entry = book.entry(kind).or_default();
            if !entry.completed || entry.reward_claimed {
                debug!(mission = kind.name(), "claim ignored — not in claimable state");
                return Ok(None);
            }
            entry.reward_claimed = true;
            entry.claimed_at = Some(now);
            let amount = entry.reward_amount;
            (amount, serde_json::to_string(&*book)?, flags_of(&book))
        };

        self.save_local(&snapshot).await?;
        self.ledger.grant(amount, GrantSource::MissionReward).await;

        // Single attempt each — mission rewards do not get the purchase
        // path's bounded retry.
        if let Err(e) = self.ledger.persist().await {
            warn!(mission = kind.name(), err = %e, "balance persist failed after claim");
        }
        if let Err(e) = self.ledger.persist_missions(flags).await {
            warn!(mission = kind.name(), err = %e, "mission flags persist failed after claim");
        }

        info!(mission = kind.name(), amount, "mission reward claimed");
        self.broadcast_updated(kind).await;
        Ok(Some(amount))
    }

    /// `Completed(unclaimed) → Incomplete`. Claimed missions cannot be
    /// uncompleted — granted credits are never clawed back.
    pub async fn uncomplete(&self, kind: MissionKind) -> Result<bool> {
        let snapshot = {
            let mut book = self.state.lock().await;
            let entry = book.entry(kind).or_default();
            if !entry.completed || entry.reward_claimed {
                return Ok(false);
            }
            entry.completed = false;
            serde_json::to_string(&*book)?
        };
        self.save_local(&snapshot).await?;
        self.broadcast_updated(kind).await;
        Ok(true)
    }

    /// Clear the daily-login claimed flag once its claim date falls behind
    /// today (Asia/Taipei). Completion is untouched.
    pub async fn apply_daily_reset(&self) -> Result<()> {
        let now = Utc::now();
        let snapshot = {
            let mut book = self.state.lock().await;
            let mut changed = false;
            for (kind, entry) in book.iter_mut() {
                if kind.is_recurring()
                    && entry.reward_claimed
                    && !claimed_today(entry.claimed_at, now)
                {
                    entry.reward_claimed = false;
                    changed = true;
                    info!(mission = kind.name(), "daily reward available again");
                }
            }
            if !changed {
                return Ok(());
            }
            serde_json::to_string(&*book)?
        };
        self.save_local(&snapshot).await
    }

    /// Overwrite local state with server-held flags (login reconciliation).
    /// A server claim on a recurring mission is honored only when it was
    /// made today in Asia/Taipei — that is what makes the daily reset
    /// durable across devices.
    pub async fn reconcile(&self, cloud: &BTreeMap<String, MissionFlags>) -> Result<()> {
        let now = Utc::now();
        let snapshot = {
            let mut book = self.state.lock().await;
            for (name, flags) in cloud {
                let Some(kind) = MissionKind::from_name(name) else {
                    debug!(mission = %name, "ignoring unknown mission from cloud");
                    continue;
                };
                let entry = book.entry(kind).or_default();
                entry.completed = flags.completed;
                entry.claimed_at = flags.claimed_at;
                entry.reward_claimed = flags.reward_claimed
                    && (!kind.is_recurring() || claimed_today(flags.claimed_at, now));
            }
            serde_json::to_string(&*book)?
        };
        self.save_local(&snapshot).await?;
        self.broadcaster
            .broadcast("mission.updated", json!({ "reason": "reconciled" }));
        Ok(())
    }

    /// Missions in display order: incomplete first, then completed-unclaimed,
    /// then claimed last. Stable within each group.
    pub async fn ordered(&self) -> Vec<(MissionKind, MissionState)> {
        let book = self.state.lock().await;
        let mut entries: Vec<(MissionKind, MissionState)> =
            book.iter().map(|(k, s)| (*k, s.clone())).collect();
        entries.sort_by_key(|(_, s)| (s.reward_claimed, s.completed));
        entries
    }

    pub async fn get(&self, kind: MissionKind) -> MissionState {
        let book = self.state.lock().await;
        book.get(&kind).cloned().unwrap_or_default()
    }

    /// Wire form for the cloud document.
    pub async fn flags(&self) -> BTreeMap<String, MissionFlags> {
        let book = self.state.lock().await;
        flags_of(&book)
    }

    pub fn reward_amount(&self, kind: MissionKind) -> i64 {
        reward_for(&self.config, kind)
    }

    async fn save_local(&self, snapshot: &str) -> Result<()> {
        self.storage.set_setting(MISSIONS_SETTING, snapshot).await
    }

    async fn broadcast_updated(&self, kind: MissionKind) {
        let state = self.get(kind).await;
        self.broadcaster.broadcast(
            "mission.updated",
            json!({
                "mission": kind.name(),
                "completed": state.completed,
                "rewardClaimed": state.reward_claimed,
            }),
        );
    }
}

fn reward_for(config: &MissionConfig, kind: MissionKind) -> i64 {
    match kind {
        MissionKind::DailyLogin => config.daily_login_reward,
        MissionKind::TwoFactorAuth => config.two_factor_reward,
        MissionKind::AccountLink => config.account_link_reward,
        MissionKind::AppRating => config.app_rating_reward,
    }
}

fn flags_of(book: &BTreeMap<MissionKind, MissionState>) -> BTreeMap<String, MissionFlags> {
    book.iter()
        .map(|(kind, state)| {
            (
                kind.name().to_string(),
                MissionFlags {
                    completed: state.completed,
                    reward_claimed: state.reward_claimed,
                    claimed_at: state.claimed_at,
                },
            )
        })
        .collect()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
