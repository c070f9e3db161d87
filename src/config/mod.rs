use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::error;

const DEFAULT_API_BASE_URL: &str = "https://api.creditd.dev";
const DEFAULT_BALANCE: i64 = 3;
const DEFAULT_AD_REWARD: i64 = 3;
const DEFAULT_PERSIST_ATTEMPTS: u32 = 3;
const DEFAULT_PERSIST_DELAY_MS: u64 = 1000;
const DEFAULT_CLOUD_TIMEOUT_SECS: u64 = 10;

// ─── LedgerConfig ─────────────────────────────────────────────────────────────

/// Entitlement ledger configuration (`[ledger]` in config.toml).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Credits a fresh identity starts with. Default: 3.
    pub default_balance: i64,
    /// Credits granted per fully-watched rewarded ad. Default: 3.
    pub ad_reward_credits: i64,
    /// Cloud persist attempts at the purchase-crediting call site
    /// (all other call sites attempt once). Default: 3.
    pub persist_retry_attempts: u32,
    /// Fixed delay between persist attempts, in milliseconds. Default: 1000.
    pub persist_retry_delay_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            default_balance: DEFAULT_BALANCE,
            ad_reward_credits: DEFAULT_AD_REWARD,
            persist_retry_attempts: DEFAULT_PERSIST_ATTEMPTS,
            persist_retry_delay_ms: DEFAULT_PERSIST_DELAY_MS,
        }
    }
}

// ─── MissionConfig ────────────────────────────────────────────────────────────

/// Mission reward amounts (`[missions]` in config.toml).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MissionConfig {
    /// Reward for the recurring daily-login mission. Default: 3.
    pub daily_login_reward: i64,
    /// Reward for enabling two-factor auth. Default: 10.
    pub two_factor_reward: i64,
    /// Reward for linking the anonymous identity to an account. Default: 10.
    pub account_link_reward: i64,
    /// Reward for rating the app. Default: 3.
    pub app_rating_reward: i64,
}

impl Default for MissionConfig {
    fn default() -> Self {
        Self {
            daily_login_reward: 3,
            two_factor_reward: 10,
            account_link_reward: 10,
            app_rating_reward: 3,
        }
    }
}

// ─── ProductConfig ────────────────────────────────────────────────────────────

/// One purchasable credit pack (`[[products]]` in config.toml).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProductConfig {
    /// Store product identifier, e.g. "credits_medium".
    pub id: String,
    /// Credits granted when the product is purchased or restored.
    pub credits: i64,
}

fn default_products() -> Vec<ProductConfig> {
    vec![
        ProductConfig { id: "credits_small".to_string(), credits: 5 },
        ProductConfig { id: "credits_medium".to_string(), credits: 20 },
        ProductConfig { id: "credits_large".to_string(), credits: 100 },
    ]
}

// ─── CloudConfig ──────────────────────────────────────────────────────────────

/// Cloud document store configuration (`[cloud]` in config.toml).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CloudConfig {
    /// Entitlement API base URL (CREDITD_API_URL env var overrides).
    pub api_base_url: String,
    /// Request timeout in seconds. Default: 10.
    pub timeout_secs: u64,
    /// Bearer token for the entitlement API. None = unauthenticated calls.
    pub auth_token: Option<String>,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            timeout_secs: DEFAULT_CLOUD_TIMEOUT_SECS,
            auth_token: None,
        }
    }
}

// ─── DaemonConfig ─────────────────────────────────────────────────────────────

/// `{data_dir}/config.toml` — all fields are optional overrides.
/// Priority: CLI / env var  >  TOML  >  built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    /// Log level filter string, e.g. "debug", "info,creditd=trace" (default: "info").
    log: Option<String>,
    /// Log output format: "pretty" (default, human-readable) | "json" (structured).
    log_format: Option<String>,
    /// Entitlement ledger settings (`[ledger]`).
    ledger: Option<LedgerConfig>,
    /// Mission reward amounts (`[missions]`).
    missions: Option<MissionConfig>,
    /// Purchasable credit packs (`[[products]]`).
    products: Option<Vec<ProductConfig>>,
    /// Cloud document store settings (`[cloud]`).
    cloud: Option<CloudConfig>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub data_dir: PathBuf,
    pub log: String,
    /// Log output format: "pretty" (default) | "json".
    pub log_format: String,
    pub ledger: LedgerConfig,
    pub missions: MissionConfig,
    pub products: Vec<ProductConfig>,
    pub cloud: CloudConfig,
}

impl DaemonConfig {
    /// Build config from CLI/env args + optional TOML file.
    ///
    /// Priority (highest to lowest):
    ///   1. CLI / env — passed as `Some(value)` from clap
    ///   2. TOML file at `{data_dir}/config.toml`
    ///   3. Built-in defaults
    pub fn new(data_dir: Option<PathBuf>, log: Option<String>) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);

        // Load TOML as the lowest-priority override layer
        let toml = load_toml(&data_dir).unwrap_or_default();

        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());

        let log_format = std::env::var("CREDITD_LOG_FORMAT")
            .ok()
            .filter(|s| !s.is_empty())
            .or(toml.log_format)
            .unwrap_or_else(|| "pretty".to_string());

        let mut cloud = toml.cloud.unwrap_or_default();
        if let Ok(url) = std::env::var("CREDITD_API_URL") {
            if !url.is_empty() {
                cloud.api_base_url = url;
            }
        }
        if let Ok(token) = std::env::var("CREDITD_API_TOKEN") {
            if !token.is_empty() {
                cloud.auth_token = Some(token);
            }
        }

        Self {
            data_dir,
            log,
            log_format,
            ledger: toml.ledger.unwrap_or_default(),
            missions: toml.missions.unwrap_or_default(),
            products: toml.products.unwrap_or_else(default_products),
            cloud,
        }
    }

    /// Defaults rooted at an explicit data dir — used by tests and one-shot commands.
    pub fn with_data_dir(data_dir: &Path) -> Self {
        Self::new(Some(data_dir.to_path_buf()), None)
    }
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        // ~/Library/Application Support/creditd
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("creditd");
        }
    }
    #[cfg(target_os = "linux")]
    {
        // $XDG_DATA_HOME/creditd or ~/.local/share/creditd
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("creditd");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".local").join("share").join("creditd");
        }
    }
    #[cfg(target_os = "windows")]
    {
        // %APPDATA%\creditd
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("creditd");
        }
    }
    PathBuf::from(".creditd")
}
