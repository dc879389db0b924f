//! One reconciliation cycle
//!
//! Per cycle: read messages newer than the watermark (excluding already
//! seen ids), oldest first; extract drop sightings; offer each to the
//! registry as an atomic insert-or-skip; an existing drop (including the
//! second occurrence of a duplicate within one batch) is a resubmission,
//! not an error. A failure on one drop rolls back only that drop and the
//! batch continues.
//!
//! Watermark rule: the watermark may only advance to a point below every
//! message that failed, so a rerun re-reads exactly the failed window.
//! Messages handled after a failure are still recorded in the seen-id set,
//! which keeps the rerun idempotent.

use chrono::{DateTime, Utc};
use dropwatch_common::config::{Config, ProjectConfig};
use dropwatch_common::extract::{extract_drop_numbers, DropSighting};
use dropwatch_common::notify::format_resubmission_note;
use dropwatch_common::registry::{DropRegistry, RegisterOutcome};
use dropwatch_common::sheet::SheetClient;
use dropwatch_common::state::MonitorState;
use dropwatch_common::store::{fetch_messages_since, Message};
use dropwatch_common::Result;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

/// Counters from one cycle, fed into health reporting.
#[derive(Debug, Default, Clone, Copy)]
pub struct CycleReport {
    pub messages_handled: u64,
    pub drops_created: u64,
    pub drops_resubmitted: u64,
    pub failures: u64,
}

/// Run one full reconciliation pass over every enabled project.
///
/// Mutates `state` in memory only; the caller persists it after a
/// successful cycle (and not at all in dry-run mode).
pub async fn run_cycle<R: DropRegistry>(
    store: &SqlitePool,
    registry: &R,
    sheets: Option<&SheetClient>,
    config: &Config,
    state: &mut MonitorState,
    dry_run: bool,
) -> Result<CycleReport> {
    let mut report = CycleReport::default();
    let since = state.last_check_time;

    // Watermark candidates: the highest fully-handled timestamp per clean
    // project, and for projects with a failure, the highest timestamp still
    // safe to pass (everything before the first failed message).
    let mut clean_highs: Vec<DateTime<Utc>> = Vec::new();
    let mut failure_caps: Vec<DateTime<Utc>> = Vec::new();

    for project in config.enabled_projects() {
        let messages = fetch_messages_since(store, &project.group_jid, since).await?;
        let new_messages: Vec<Message> = messages
            .into_iter()
            .filter(|m| !state.is_processed(&m.id))
            .collect();

        if new_messages.is_empty() {
            debug!("No new messages for {}", project.name);
            continue;
        }
        info!("{}: {} new messages", project.name, new_messages.len());

        let mut safe_high = since;
        let mut failed = false;

        for message in &new_messages {
            let message_ok =
                process_message(registry, sheets, project, message, &mut report, dry_run).await;

            if message_ok {
                state.mark_processed(&message.id);
                report.messages_handled += 1;
                if !failed && message.timestamp > safe_high {
                    safe_high = message.timestamp;
                }
            } else {
                failed = true;
            }
        }

        if failed {
            failure_caps.push(safe_high);
        } else {
            clean_highs.push(safe_high);
        }
    }

    let new_watermark = match failure_caps.iter().min() {
        Some(&cap) => cap,
        None => clean_highs.into_iter().max().unwrap_or(since),
    };
    state.advance_watermark(new_watermark);

    Ok(report)
}

/// Handle every sighting in one message. Returns false if any sighting
/// failed, in which case the message stays out of the seen-id set and the
/// watermark freezes below it.
async fn process_message<R: DropRegistry>(
    registry: &R,
    sheets: Option<&SheetClient>,
    project: &ProjectConfig,
    message: &Message,
    report: &mut CycleReport,
    dry_run: bool,
) -> bool {
    let mut message_ok = true;

    for drop_number in extract_drop_numbers(&message.content) {
        let sighting = DropSighting {
            drop_number,
            message_id: message.id.clone(),
            chat_jid: message.chat_jid.clone(),
            sender: message.sender.clone(),
            timestamp: message.timestamp,
        };

        if dry_run {
            info!(
                "DRY RUN: would reconcile {} from {} ({})",
                sighting.drop_number, sighting.sender, project.name
            );
            continue;
        }

        match reconcile_sighting(registry, sheets, project, message, &sighting).await {
            Ok(RegisterOutcome::Created) => report.drops_created += 1,
            Ok(RegisterOutcome::AlreadyRegistered) => report.drops_resubmitted += 1,
            Err(e) => {
                warn!(
                    "Failed to process {} from message {}: {}",
                    sighting.drop_number, message.id, e
                );
                report.failures += 1;
                message_ok = false;
            }
        }
    }

    message_ok
}

/// Handle one sighting: create, or record as resubmission. The sheet mirror
/// is secondary and eventually consistent, so sheet writes are best-effort
/// and never fail the drop.
async fn reconcile_sighting<R: DropRegistry>(
    registry: &R,
    sheets: Option<&SheetClient>,
    project: &ProjectConfig,
    message: &Message,
    sighting: &DropSighting,
) -> Result<RegisterOutcome> {
    let outcome = registry.register(sighting, &project.name).await?;

    match outcome {
        RegisterOutcome::Created => {
            info!("Registered new drop {}", sighting.drop_number);
            if let (Some(client), Some(tab)) = (sheets, project.sheet_tab.as_deref()) {
                let date = sighting.timestamp.format("%Y-%m-%d").to_string();
                if let Err(e) = client
                    .append_drop_row(tab, &date, &sighting.drop_number, &sighting.contractor_name())
                    .await
                {
                    warn!("Sheet append for {} failed: {}", sighting.drop_number, e);
                }
            }
        }
        RegisterOutcome::AlreadyRegistered => {
            info!("{}: resubmission detected", sighting.drop_number);
            let note = format_resubmission_note(&sighting.contractor_name(), &message.content);
            registry
                .record_resubmission(
                    &sighting.drop_number,
                    &sighting.contractor_name(),
                    &project.name,
                    &note,
                )
                .await?;

            if let (Some(client), Some(tab)) = (sheets, project.sheet_tab.as_deref()) {
                if let Err(e) = mark_sheet_resubmitted(client, tab, &sighting.drop_number).await {
                    warn!("Sheet flag reset for {} failed: {}", sighting.drop_number, e);
                }
            }
        }
    }

    Ok(outcome)
}

async fn mark_sheet_resubmitted(client: &SheetClient, tab: &str, drop_number: &str) -> Result<()> {
    let values = client.read_tab(tab).await?;
    match dropwatch_common::sheet::find_row_by_drop(&values, drop_number) {
        Some(row_number) => client.mark_resubmitted(tab, row_number).await,
        None => {
            debug!("{} not present in sheet tab {}", drop_number, tab);
            Ok(())
        }
    }
}
