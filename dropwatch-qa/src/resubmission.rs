//! WhatsApp resubmission scanner
//!
//! Agents announce updated photos in the group ("DR1748808 updated",
//! "resubmitted DR1748808"). The scanner tails each enabled group for
//! messages that pair a resubmission keyword with a drop number, resets
//! the review flags in Postgres and the sheet flag trio, and appends a
//! note to the installation. A keyword without a drop number is ignored:
//! the identifier requirement is what bounds false positives from normal
//! group chatter.
//!
//! Watermark handling follows the reconciler: seen ids are recorded per
//! handled message, and the watermark never advances past a message whose
//! writes failed.

use chrono::{DateTime, Utc};
use dropwatch_common::config::{Config, ProjectConfig};
use dropwatch_common::extract::{contractor_label, extract_drop_numbers};
use dropwatch_common::notify::format_resubmission_note;
use dropwatch_common::registry::DropRegistry;
use dropwatch_common::sheet::{find_row_by_drop, SheetClient};
use dropwatch_common::state::MonitorState;
use dropwatch_common::store::{fetch_messages_since, Message};
use dropwatch_common::Result;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

/// Phrases that mark a message as a resubmission announcement. Matched
/// case-insensitively by containment; longer phrases first for log clarity.
pub const RESUBMISSION_KEYWORDS: [&str; 10] = [
    "ready for review",
    "re-submitted",
    "resubmitted",
    "re-submit",
    "resubmit",
    "uploaded",
    "updated",
    "fixed",
    "done",
    "sorted",
];

/// True when the text carries a resubmission phrase. The caller must still
/// require a drop number before acting.
pub fn is_resubmission_message(text: &str) -> bool {
    let lowered = text.to_lowercase();
    RESUBMISSION_KEYWORDS
        .iter()
        .any(|keyword| lowered.contains(keyword))
}

/// Counters from one resubmission pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct ResubmissionReport {
    pub messages_handled: u64,
    pub resubmissions: u64,
    pub failures: u64,
}

/// One scan over every enabled project. Same watermark contract as the
/// reconciler cycle: `state` is mutated in memory, persisted by the caller.
pub async fn run_resubmission_cycle<R: DropRegistry>(
    store: &SqlitePool,
    registry: &R,
    sheets: Option<&SheetClient>,
    config: &Config,
    state: &mut MonitorState,
    dry_run: bool,
) -> Result<ResubmissionReport> {
    let mut report = ResubmissionReport::default();
    let since = state.last_check_time;

    let mut clean_highs: Vec<DateTime<Utc>> = Vec::new();
    let mut failure_caps: Vec<DateTime<Utc>> = Vec::new();

    for project in config.enabled_projects() {
        let messages = fetch_messages_since(store, &project.group_jid, since).await?;
        let new_messages: Vec<Message> = messages
            .into_iter()
            .filter(|m| !state.is_processed(&m.id))
            .collect();

        if new_messages.is_empty() {
            continue;
        }
        debug!("{}: {} new messages", project.name, new_messages.len());

        let mut safe_high = since;
        let mut failed = false;

        for message in &new_messages {
            let message_ok =
                handle_message(registry, sheets, project, message, &mut report, dry_run).await;

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

async fn handle_message<R: DropRegistry>(
    registry: &R,
    sheets: Option<&SheetClient>,
    project: &ProjectConfig,
    message: &Message,
    report: &mut ResubmissionReport,
    dry_run: bool,
) -> bool {
    if !is_resubmission_message(&message.content) {
        return true;
    }
    let drops = extract_drop_numbers(&message.content);
    if drops.is_empty() {
        // Keyword chatter without an identifier; nothing to act on.
        return true;
    }

    let contractor = contractor_label(&message.sender);
    let mut message_ok = true;

    for drop_number in drops {
        if dry_run {
            info!(
                "DRY RUN: would record resubmission of {} from {}",
                drop_number, message.sender
            );
            continue;
        }

        let note = format_resubmission_note(&contractor, &message.content);
        match registry
            .record_resubmission(&drop_number, &contractor, &project.name, &note)
            .await
        {
            Ok(()) => {
                report.resubmissions += 1;
                info!("{}: resubmission announced by {}", drop_number, message.sender);
                if let (Some(client), Some(tab)) = (sheets, project.sheet_tab.as_deref()) {
                    if let Err(e) = reset_sheet_flags(client, tab, &drop_number).await {
                        warn!("Sheet flag reset for {} failed: {}", drop_number, e);
                    }
                }
            }
            Err(e) => {
                warn!("Resubmission of {} failed: {}", drop_number, e);
                report.failures += 1;
                message_ok = false;
            }
        }
    }

    message_ok
}

async fn reset_sheet_flags(client: &SheetClient, tab: &str, drop_number: &str) -> Result<()> {
    let values = client.read_tab(tab).await?;
    match find_row_by_drop(&values, drop_number) {
        Some(row_number) => client.mark_resubmitted(tab, row_number).await,
        None => {
            debug!("{} not present in sheet tab {}", drop_number, tab);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_match_is_case_insensitive() {
        assert!(is_resubmission_message("DR1748808 UPDATED"));
        assert!(is_resubmission_message("Resubmitted dr1748808, please check"));
        assert!(is_resubmission_message("dr1 ready for review"));
    }

    #[test]
    fn plain_chatter_does_not_match() {
        assert!(!is_resubmission_message("morning team"));
        assert!(!is_resubmission_message("DR1748808 installed today"));
    }

    #[test]
    fn keyword_without_drop_number_is_not_actionable() {
        // The cycle requires both; this documents the pairing contract.
        let text = "all done for today";
        assert!(is_resubmission_message(text));
        assert!(dropwatch_common::extract::extract_drop_numbers(text).is_empty());
    }

}
