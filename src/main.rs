use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::io::AsyncBufReadExt as _;
use tokio::sync::mpsc;
use tracing::{info, warn};

use creditd::cloud::{CloudStore, HttpCloudStore, MemoryCloudStore};
use creditd::config::DaemonConfig;
use creditd::events::SdkEvent;
use creditd::ledger::LedgerError;
use creditd::missions::MissionKind;
use creditd::AppContext;

#[derive(Parser)]
#[command(
    name = "creditd",
    about = "creditd — entitlement ledger daemon for usage-credit apps",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Data directory for the SQLite database and config
    #[arg(long, env = "CREDITD_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "CREDITD_LOG")]
    log: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "CREDITD_LOG_FILE")]
    log_file: Option<std::path::PathBuf>,

    /// Use an in-memory cloud store instead of the entitlement API.
    ///
    /// Balances still persist locally; cloud state lives only for the
    /// process lifetime. Useful for development and air-gapped testing.
    #[arg(long, global = true)]
    offline: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Run the sidecar event loop (default when no subcommand given).
    ///
    /// Reads `{type, payload}` SDK events as JSON lines on stdin and emits
    /// notifications as JSON lines on stdout.
    ///
    /// Examples:
    ///   creditd serve
    ///   echo '{"type":"adRewardEarned"}' | creditd serve --offline
    Serve,
    /// Print identity, balance, and the mission table.
    Status,
    /// Sync the balance for the current identity and print it.
    Sync,
    /// Spend credits (default: 1).
    Consume {
        /// Number of credits to spend
        #[arg(long, default_value_t = 1)]
        count: i64,
    },
    /// Claim a completed mission's reward.
    Claim {
        /// Which mission to claim
        #[arg(value_enum)]
        mission: MissionKind,
    },
    /// Link the anonymous identity to an account and transfer the balance.
    Link {
        /// Authenticated user id
        user_id: String,
    },
    /// Dump the purchase audit log.
    Records,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = DaemonConfig::new(args.data_dir, args.log);
    let _guard = setup_logging(&config.log, args.log_file.as_deref(), &config.log_format);

    let cloud = cloud_store(&config, args.offline)?;

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config, cloud).await,
        Command::Status => status(config, cloud).await,
        Command::Sync => sync(config, cloud).await,
        Command::Consume { count } => consume(config, cloud, count).await,
        Command::Claim { mission } => claim(config, cloud, mission).await,
        Command::Link { user_id } => link(config, cloud, &user_id).await,
        Command::Records => records(config, cloud).await,
    }
}

fn cloud_store(config: &DaemonConfig, offline: bool) -> Result<Arc<dyn CloudStore>> {
    if offline {
        Ok(Arc::new(MemoryCloudStore::new()))
    } else {
        Ok(Arc::new(HttpCloudStore::new(&config.cloud)?))
    }
}

// ─── serve ────────────────────────────────────────────────────────────────────

async fn serve(config: DaemonConfig, cloud: Arc<dyn CloudStore>) -> Result<()> {
    let ctx = AppContext::init(config, cloud).await?;
    info!(data_dir = %ctx.config.data_dir.display(), "creditd starting");

    // Outbound: notifications to stdout, one JSON object per line.
    let mut notifications = ctx.broadcaster.subscribe();
    tokio::spawn(async move {
        while let Ok(line) = notifications.recv().await {
            println!("{line}");
        }
    });

    let (tx, rx) = mpsc::channel::<SdkEvent>(256);
    let dispatcher_task = tokio::spawn(ctx.dispatcher().run(rx));

    // The host app would fire this on foreground; seed it so a bare `serve`
    // applies the daily boundary and syncs immediately.
    let _ = tx.send(SdkEvent::AppOpened).await;

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<SdkEvent>(line) {
            Ok(event) => {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            Err(e) => warn!(err = %e, "ignoring unparseable event line"),
        }
    }

    drop(tx);
    dispatcher_task.await?;
    Ok(())
}

// ─── one-shot commands ────────────────────────────────────────────────────────

async fn status(config: DaemonConfig, cloud: Arc<dyn CloudStore>) -> Result<()> {
    let ctx = AppContext::init(config, cloud).await?;
    if let Err(e) = ctx.ledger.sync().await {
        warn!(err = %e, "cloud sync failed — showing last known state");
    }

    let identity = ctx.identity.current().await;
    println!("identity: {}", identity.audit_label());
    println!("balance:  {}", ctx.ledger.balance().await);
    println!();
    println!("missions:");
    for (kind, state) in ctx.missions.ordered().await {
        let status = if state.reward_claimed {
            "claimed"
        } else if state.completed {
            "claimable"
        } else {
            "incomplete"
        };
        println!("  {:<16} {:<10} +{}", kind.name(), status, state.reward_amount);
    }
    Ok(())
}

async fn sync(config: DaemonConfig, cloud: Arc<dyn CloudStore>) -> Result<()> {
    let ctx = AppContext::init(config, cloud).await?;
    ctx.ledger.sync().await?;
    println!("balance: {}", ctx.ledger.balance().await);
    Ok(())
}

async fn consume(config: DaemonConfig, cloud: Arc<dyn CloudStore>, count: i64) -> Result<()> {
    let ctx = AppContext::init(config, cloud).await?;
    ctx.ledger.sync().await?;
    match ctx.ledger.consume(count).await {
        Ok(remaining) => {
            if let Err(e) = ctx.ledger.persist().await {
                warn!(err = %e, "balance persist failed");
            }
            println!("balance: {remaining}");
        }
        Err(LedgerError::InsufficientCredits { balance }) => {
            println!("out of credits (balance {balance}) — watch an ad or purchase a pack");
        }
    }
    Ok(())
}

async fn claim(
    config: DaemonConfig,
    cloud: Arc<dyn CloudStore>,
    mission: MissionKind,
) -> Result<()> {
    let ctx = AppContext::init(config, cloud).await?;
    ctx.ledger.sync().await?;
    match ctx.missions.claim(mission).await? {
        Some(amount) => println!(
            "claimed {} (+{amount}) — balance {}",
            mission.name(),
            ctx.ledger.balance().await
        ),
        None => println!("{} is not claimable right now", mission.name()),
    }
    Ok(())
}

async fn link(config: DaemonConfig, cloud: Arc<dyn CloudStore>, user_id: &str) -> Result<()> {
    let ctx = AppContext::init(config, cloud).await?;
    ctx.dispatcher()
        .dispatch(SdkEvent::AccountLinked {
            user_id: user_id.to_string(),
        })
        .await?;
    println!(
        "linked to {user_id} — balance {}",
        ctx.ledger.balance().await
    );
    Ok(())
}

async fn records(config: DaemonConfig, cloud: Arc<dyn CloudStore>) -> Result<()> {
    let ctx = AppContext::init(config, cloud).await?;
    let records = ctx.storage.list_purchase_records().await?;
    if records.is_empty() {
        println!("no purchase records");
        return Ok(());
    }
    for record in records {
        println!(
            "{}  {:<24} {:<16} +{}  {}",
            record.created_at, record.identity, record.product_id, record.credits_granted, record.id
        );
    }
    Ok(())
}

// ─── logging ──────────────────────────────────────────────────────────────────

/// Initialize the tracing subscriber.
/// If `log_file` is set, logs go to both stdout and a daily-rolling file.
/// Returns a `WorkerGuard` that must stay alive for the process lifetime.
///
/// `log_format` may be `"pretty"` (default, human-readable compact format) or
/// `"json"` (structured JSON for log aggregators).
///
/// If the log directory cannot be created, falls back to stdout-only logging
/// with a warning — never panics.
fn setup_logging(
    log_level: &str,
    log_file: Option<&std::path::Path>,
    log_format: &str,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let use_json = log_format == "json";

    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let filename = path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("creditd.log"));

        // Ensure the directory exists before tracing-appender tries to open it.
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!(
                "warn: could not create log directory '{}': {e} — falling back to stderr",
                dir.display()
            );
            if use_json {
                tracing_subscriber::fmt()
                    .json()
                    .with_env_filter(log_level)
                    .with_writer(std::io::stderr)
                    .init();
            } else {
                tracing_subscriber::fmt()
                    .with_env_filter(log_level)
                    .with_writer(std::io::stderr)
                    .compact()
                    .init();
            }
            return None;
        }

        let appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        if use_json {
            tracing_subscriber::registry()
                .with(EnvFilter::new(log_level))
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .with(fmt::layer().json().with_writer(non_blocking))
                .init();
        } else {
            tracing_subscriber::registry()
                .with(EnvFilter::new(log_level))
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .with(fmt::layer().with_writer(non_blocking))
                .init();
        }

        Some(guard)
    } else if use_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(log_level)
            .with_writer(std::io::stderr)
            .init();
        None
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(log_level)
            .with_writer(std::io::stderr)
            .compact()
            .init();
        None
    }
}
