//! dropwatch-qa - QA feedback monitor
//!
//! Two scans per cycle: the sheet mirror for reviews marked incomplete
//! (feedback goes out at most once per incomplete verdict), and the
//! WhatsApp groups for resubmission announcements (review flags reset in
//! both stores). Feedback is threaded onto the agent's original drop
//! message when it can still be found in the mirror.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use dropwatch_common::config::Config;
use dropwatch_common::health::MonitorHealth;
use dropwatch_common::notify::Notifier;
use dropwatch_common::registry::PgRegistry;
use dropwatch_common::sheet::SheetClient;
use dropwatch_common::state::MonitorState;
use dropwatch_common::timing::remaining_sleep;
use tracing::{error, info, warn};

use dropwatch_qa::feedback::{run_feedback_cycle, NotifiedSet};
use dropwatch_qa::resubmission::run_resubmission_cycle;

const STATE_FILE: &str = "qa_monitor_state.json";
const HEALTH_FILE: &str = "qa_monitor_health.json";
const MIN_INTERVAL_SECS: u64 = 5;
const CONNECT_ATTEMPTS: u32 = 5;

/// Command-line arguments for dropwatch-qa
#[derive(Parser, Debug)]
#[command(name = "dropwatch-qa")]
#[command(about = "WhatsApp QA feedback monitor")]
#[command(version)]
struct Args {
    /// Check interval in seconds
    #[arg(long, default_value = "30")]
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
    info!("Starting Dropwatch QA monitor v{}", env!("CARGO_PKG_VERSION"));

    let interval = if args.interval < MIN_INTERVAL_SECS {
        warn!("Minimum interval is {MIN_INTERVAL_SECS}s, clamping");
        MIN_INTERVAL_SECS
    } else {
        args.interval
    };

    let config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    if args.dry_run {
        info!("DRY RUN MODE - no database or sheet writes, no messages sent");
    }

    let store = connect_store_with_retry(&config).await?;
    let registry = connect_registry_with_retry(&config).await?;
    registry.init_schema().await.context("Failed to initialize schema")?;
    info!("Connected to message store and registry");

    let sheets = match &config.sheets {
        Some(sheets_config) => Some(SheetClient::new(sheets_config)?),
        None => {
            warn!("No sheet mirror configured; feedback scan disabled");
            None
        }
    };
    let notifier = Notifier::new(&config, args.dry_run)?;

    let state_path = config.state_dir.join(STATE_FILE);
    let mut state = MonitorState::load(&state_path);
    let mut health = MonitorHealth::new(config.state_dir.join(HEALTH_FILE));
    let mut notified = NotifiedSet::new();

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    info!("Monitor loop started (interval {interval}s)");
    loop {
        let cycle_start = chrono::Utc::now();
        let mut cycle_ok = true;
        let mut handled = 0u64;

        if let Some(client) = sheets.as_ref() {
            match run_feedback_cycle(
                &registry,
                client,
                &store,
                &notifier,
                &config,
                &mut notified,
                args.dry_run,
            )
            .await
            {
                Ok(report) => {
                    if report.feedback_sent + report.failures > 0 {
                        info!(
                            "Feedback scan: {} sent, {} already notified, {} failed ({} rows)",
                            report.feedback_sent,
                            report.skipped_already_notified,
                            report.failures,
                            report.rows_scanned
                        );
                    }
                    handled += report.rows_scanned;
                }
                Err(e) => {
                    warn!("Feedback scan failed, will retry next interval: {}", e);
                    health.record_error(&e.to_string());
                    cycle_ok = false;
                }
            }
        }

        match run_resubmission_cycle(&store, &registry, sheets.as_ref(), &config, &mut state, args.dry_run)
            .await
        {
            Ok(report) => {
                if report.resubmissions + report.failures > 0 {
                    info!(
                        "Resubmission scan: {} recorded, {} failed ({} messages)",
                        report.resubmissions, report.failures, report.messages_handled
                    );
                }
                handled += report.messages_handled;
                if !args.dry_run {
                    if let Err(e) = state.save(&state_path) {
                        error!("Failed to save state: {}", e);
                    }
                }
            }
            Err(e) => {
                warn!("Resubmission scan failed, will retry next interval: {}", e);
                health.record_error(&e.to_string());
                cycle_ok = false;
            }
        }

        if cycle_ok {
            health.record_success(handled);
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
        "Monitor stopped: {} items processed, {} errors",
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
