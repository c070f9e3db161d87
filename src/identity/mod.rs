//! Identity — who owns the entitlement balance.
//!
//! Exactly one identity owns the balance at any time: the anonymous device
//! identity (a SHA-256 fingerprint of a platform hardware ID, stored in the
//! `settings` table on first run) or an authenticated user id after account
//! linking. The Anonymous→Authenticated transition is one-directional and
//! survives restarts.

use anyhow::{bail, Result};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use crate::storage::Storage;

const DEVICE_KEY_SETTING: &str = "device_key";
const LINKED_USER_SETTING: &str = "account.user_id";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Anonymous { device_key: String },
    Authenticated { user_id: String },
}

impl Identity {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Identity::Authenticated { .. })
    }

    /// Stable label used in the purchase audit log.
    pub fn audit_label(&self) -> String {
        match self {
            Identity::Anonymous { device_key } => format!("anonymous:{device_key}"),
            Identity::Authenticated { user_id } => format!("user:{user_id}"),
        }
    }
}

/// Holds the current identity and performs the one-way link transition.
pub struct IdentityProvider {
    storage: Arc<Storage>,
    current: RwLock<Identity>,
}

impl IdentityProvider {
    /// Restore identity from storage: a previously linked account wins,
    /// otherwise the stable anonymous device key.
    pub async fn load(storage: Arc<Storage>) -> Result<Self> {
        let identity = match storage.get_setting(LINKED_USER_SETTING).await? {
            Some(user_id) => Identity::Authenticated { user_id },
            None => Identity::Anonymous {
                device_key: device_key(&storage).await?,
            },
        };
        Ok(Self {
            storage,
            current: RwLock::new(identity),
        })
    }

    pub async fn current(&self) -> Identity {
        self.current.read().await.clone()
    }

    pub async fn is_authenticated(&self) -> bool {
        self.current.read().await.is_authenticated()
    }

    pub async fn user_id(&self) -> Option<String> {
        match &*self.current.read().await {
            Identity::Authenticated { user_id } => Some(user_id.clone()),
            Identity::Anonymous { .. } => None,
        }
    }

    /// Attach a real account to the anonymous identity.
    ///
    /// One-directional: linking an already-authenticated identity is an
    /// error, never a re-link.
    pub async fn link(&self, user_id: &str) -> Result<()> {
        let mut current = self.current.write().await;
        if let Identity::Authenticated { user_id: existing } = &*current {
            bail!("identity is already linked to user {existing}");
        }
        self.storage
            .set_setting(LINKED_USER_SETTING, user_id)
            .await?;
        *current = Identity::Authenticated {
            user_id: user_id.to_string(),
        };
        info!(user_id, "anonymous identity linked to account");
        Ok(())
    }
}

// ─── Device key ───────────────────────────────────────────────────────────────

/// Returns the stable anonymous device key.
///
/// On first call it reads a platform hardware ID, hashes it with SHA-256,
/// stores the hex digest in the `settings` table, and returns it. Every
/// subsequent call returns the stored value, so the key stays stable even
/// when the hardware probe would not (e.g. the fallback path).
pub async fn device_key(storage: &Storage) -> Result<String> {
    if let Some(key) = storage.get_setting(DEVICE_KEY_SETTING).await? {
        return Ok(key);
    }

    let raw = platform_hardware_id()
        .unwrap_or_else(|| format!("fallback-{}", uuid::Uuid::new_v4()));
    let digest = hex_sha256(raw.trim());
    storage.set_setting(DEVICE_KEY_SETTING, &digest).await?;
    Ok(digest)
}

/// Best-effort platform hardware identifier. None on unsupported platforms
/// or probe failure — the caller substitutes a persisted random id.
fn platform_hardware_id() -> Option<String> {
    #[cfg(target_os = "linux")]
    return linux_machine_id();

    #[cfg(target_os = "macos")]
    return macos_platform_uuid();

    #[cfg(target_os = "windows")]
    return windows_machine_guid();

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    None
}

#[cfg(target_os = "linux")]
fn linux_machine_id() -> Option<String> {
    // /etc/machine-id is guaranteed on any systemd-based distro
    std::fs::read_to_string("/etc/machine-id")
        .or_else(|_| std::fs::read_to_string("/var/lib/dbus/machine-id"))
        .ok()
}

#[cfg(target_os = "macos")]
fn macos_platform_uuid() -> Option<String> {
    let out = std::process::Command::new("ioreg")
        .args(["-rd1", "-c", "IOPlatformExpertDevice"])
        .output()
        .ok()?;
    let stdout = String::from_utf8_lossy(&out.stdout);
    // line looks like: "IOPlatformUUID" = "XXXXXXXX-XXXX-..."
    stdout
        .lines()
        .find(|l| l.contains("IOPlatformUUID"))
        .and_then(|l| l.split('"').nth(3))
        .map(str::to_string)
}

#[cfg(target_os = "windows")]
fn windows_machine_guid() -> Option<String> {
    let out = std::process::Command::new("reg")
        .args([
            "query",
            r"HKLM\SOFTWARE\Microsoft\Cryptography",
            "/v",
            "MachineGuid",
        ])
        .output()
        .ok()?;
    let stdout = String::from_utf8_lossy(&out.stdout);
    stdout
        .lines()
        .find(|l| l.contains("MachineGuid"))
        .and_then(|l| l.split_whitespace().last())
        .map(str::to_string)
}

fn hex_sha256(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
