//! dropwatch-drops - Drop number reconciler
//!
//! Tails the WhatsApp message mirror for configured project groups,
//! extracts drop numbers, and creates installation and QA review records.
//! Re-sighted drops are recorded as resubmissions. Crash-safe resumption
//! comes from the watermark state file; processing is idempotent across
//! restarts.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use dropwatch_common::config::Config;
use dropwatch_common::health::MonitorHealth;
use dropwatch_common::registry::PgRegistry;
use dropwatch_common::sheet::SheetClient;
use dropwatch_common::state::MonitorState;
use dropwatch_common::timing::remaining_sleep;
use tracing::{error, info, warn};

use dropwatch_drops::cycle::run_cycle;

const STATE_FILE: &str = "drop_monitor_state.json";
const HEALTH_FILE: &str = "drop_monitor_health.json";
const MIN_INTERVAL_SECS: u64 = 5;
const CONNECT_ATTEMPTS: u32 = 5;

/// Command-line arguments for dropwatch-drops
#[derive(Parser, Debug)]
#[command(name = "dropwatch-drops")]
#[command(about = "WhatsApp drop number reconciler")]
#[command(version)]
struct Args {
    /// Check interval in seconds
    #[arg(long, default_value = "15")]
    interval: u64,

    /// Preview mode: log intended actions, no external writes
    #[arg(long)]
    dry_run: bool,

    /// Run a single cycle then exit
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
    info!("Starting Dropwatch drop reconciler v{}", env!("CARGO_PKG_VERSION"));

    let interval = if args.interval < MIN_INTERVAL_SECS {
        warn!("Minimum interval is {MIN_INTERVAL_SECS}s, clamping");
        MIN_INTERVAL_SECS
    } else {
        args.interval
    };

    // Configuration errors are fatal before the loop starts.
    let config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    info!(
        "Monitoring {} enabled project(s)",
        config.enabled_projects().count()
    );
    if args.dry_run {
        info!("DRY RUN MODE - no database or sheet writes will be performed");
    }

    // Startup connectivity, with bounded retry for transient faults.
    let store = connect_store_with_retry(&config).await?;
    let registry = connect_registry_with_retry(&config).await?;
    registry.init_schema().await.context("Failed to initialize schema")?;
    info!("Connected to message store and registry");

    let sheets = match &config.sheets {
        Some(sheets_config) => Some(SheetClient::new(sheets_config)?),
        None => None,
    };

    let state_path = config.state_dir.join(STATE_FILE);
    let mut state = MonitorState::load(&state_path);
    let mut health = MonitorHealth::new(config.state_dir.join(HEALTH_FILE));

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    info!("Monitor loop started (interval {interval}s)");
    loop {
        let cycle_start = chrono::Utc::now();

        match run_cycle(&store, &registry, sheets.as_ref(), &config, &mut state, args.dry_run).await
        {
            Ok(report) => {
                if report.drops_created + report.drops_resubmitted + report.failures > 0 {
                    info!(
                        "Cycle complete: {} created, {} resubmitted, {} failed ({} messages)",
                        report.drops_created,
                        report.drops_resubmitted,
                        report.failures,
                        report.messages_handled
                    );
                }
                health.record_success(report.messages_handled);
                // State is only persisted for real runs; a dry run must not
                // consume the replay window.
                if !args.dry_run {
                    if let Err(e) = state.save(&state_path) {
                        error!("Failed to save state: {}", e);
                    }
                }
            }
            Err(e) => {
                // The loop is the retry mechanism: the watermark was not
                // advanced, so the next cycle re-reads the same window.
                warn!("Cycle failed, will retry next interval: {}", e);
                health.record_error(&e.to_string());
            }
        }

        if args.once {
            info!("Single cycle requested, exiting");
            break;
        }

        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }
            _ = tokio::time::sleep(remaining_sleep(cycle_start, interval)) => {}
        }
    }

    info!(
        "Monitor stopped: {} messages processed, {} errors",
        health.messages_processed_count, health.errors_count
    );
    Ok(())
}

async fn connect_store_with_retry(config: &Config) -> Result<sqlx::SqlitePool> {
    let mut delay = Duration::from_secs(1);
    for attempt in 1..=CONNECT_ATTEMPTS {
        match dropwatch_common::store::connect_readonly(&config.messages_db).await {
            Ok(pool) => return Ok(pool),
            Err(e @ dropwatch_common::Error::Config(_)) => {
                // Missing database is configuration-class: exit now.
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

async fn connect_registry_with_retry(config: &Config) -> Result<PgRegistry> {
    let mut delay = Duration::from_secs(1);
    for attempt in 1..=CONNECT_ATTEMPTS {
        match PgRegistry::connect(&config.postgres_url).await {
            Ok(registry) => match registry.ping().await {
                Ok(()) => return Ok(registry),
                Err(e) if attempt < CONNECT_ATTEMPTS => {
                    warn!("Registry ping attempt {attempt} failed: {e}, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(e).context("Registry unreachable"),
            },
            Err(e) if attempt < CONNECT_ATTEMPTS => {
                warn!("Registry connect attempt {attempt} failed: {e}, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e).context("Registry unreachable"),
        }
    }
    unreachable!("retry loop returns on final attempt")
}

/// Cooperative shutdown: resolves on Ctrl+C or SIGTERM; the in-flight cycle
/// finishes before the loop exits.
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
