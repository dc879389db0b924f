//! dropwatch-kill - Emergency-stop monitor
//!
//! Polls the enabled WhatsApp groups for a kill token. On a sighting it
//! logs the full provenance, runs the configured shutdown command, and
//! exits. The watermark lives in memory only: a missed poll just widens
//! the next scan window, and a scan error leaves it where it was.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use dropwatch_common::config::Config;
use tracing::{error, info, warn};

use dropwatch_kill::scan::{scan_for_kill, KillSighting};

const MIN_INTERVAL_SECS: u64 = 2;
const CONNECT_ATTEMPTS: u32 = 5;
const STARTUP_LOOKBACK_MINS: i64 = 5;

/// Command-line arguments for dropwatch-kill
#[derive(Parser, Debug)]
#[command(name = "dropwatch-kill")]
#[command(about = "WhatsApp emergency-stop monitor")]
#[command(version)]
struct Args {
    /// Check interval in seconds
    #[arg(long, default_value = "10")]
    interval: u64,

    /// Preview mode: log the sighting, do not run the shutdown command
    #[arg(long)]
    dry_run: bool,

    /// Run a single scan then exit
    #[arg(long)]
    once: bool,

    /// Path to the config file
    #[arg(long, env = "DROPWATCH_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();
    info!("Starting Dropwatch kill monitor v{}", env!("CARGO_PKG_VERSION"));

    let interval = if args.interval < MIN_INTERVAL_SECS {
        warn!("Minimum interval is {MIN_INTERVAL_SECS}s, clamping");
        MIN_INTERVAL_SECS
    } else {
        args.interval
    };

    let config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    if config.shutdown_command.is_empty() && !args.dry_run {
        warn!("No shutdown_command configured; a kill token will only be logged");
    }

    let store = connect_store_with_retry(&config).await?;
    info!(
        "Watching {} enabled group(s), interval {interval}s",
        config.enabled_projects().count()
    );

    // In-memory watermark only. Start a few minutes back so a token posted
    // during a restart is still caught.
    let mut since = chrono::Utc::now() - chrono::Duration::minutes(STARTUP_LOOKBACK_MINS);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        let scan_start = chrono::Utc::now();

        match scan_for_kill(&store, &config, since).await {
            Ok(Some(sighting)) => {
                log_sighting(&sighting);
                if args.dry_run {
                    info!("DRY RUN: shutdown command not executed");
                    return Ok(());
                }
                return execute_shutdown(&config.shutdown_command).await;
            }
            Ok(None) => {
                // Clean scan: everything up to the scan start is covered.
                since = scan_start;
            }
            Err(e) => {
                // Watermark untouched; the next scan re-reads this window.
                warn!("Scan failed, will retry next interval: {}", e);
            }
        }

        if args.once {
            info!("Single scan requested, exiting");
            return Ok(());
        }

        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                return Ok(());
            }
            _ = tokio::time::sleep(Duration::from_secs(interval)) => {}
        }
    }
}

fn log_sighting(sighting: &KillSighting) {
    error!(
        "KILL TOKEN RECEIVED: '{}' in {} ({}) from {} (message {}, at {})",
        sighting.token,
        sighting.project,
        sighting.group_jid,
        sighting.sender,
        sighting.message_id,
        sighting.timestamp
    );
}

async fn execute_shutdown(command: &[String]) -> Result<()> {
    let Some((program, cmd_args)) = command.split_first() else {
        error!("Kill token received but no shutdown_command configured");
        return Ok(());
    };

    info!("Executing shutdown command: {}", command.join(" "));
    let status = tokio::process::Command::new(program)
        .args(cmd_args)
        .status()
        .await
        .context("Failed to launch shutdown command")?;

    if !status.success() {
        bail!("Shutdown command exited with {status}");
    }
    info!("Shutdown command completed, exiting");
    Ok(())
}

async fn connect_store_with_retry(config: &Config) -> Result<sqlx::SqlitePool> {
    let mut delay = Duration::from_secs(1);
    for attempt in 1..=CONNECT_ATTEMPTS {
        match dropwatch_common::store::connect_readonly(&config.messages_db).await {
            Ok(pool) => return Ok(pool),
            Err(e @ dropwatch_common::Error::Config(_)) => {
                return Err(e).context("Message store unavailable");
            }
            Err(e) if attempt < CONNECT_ATTEMPTS => {
                warn!("Message store connect attempt {attempt} failed: {e}, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e).context("Message store unreachable"),
        }
    }
    unreachable!("retry loop returns on final attempt")
}

/// Cooperative shutdown: resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
