//! Sheet-driven feedback cycle
//!
//! Reviewers work in the sheet: they tick step checkboxes and set the
//! incomplete flag in column V. Each cycle reads every configured tab,
//! mirrors the reviewer's verdict into Postgres, and sends the agent one
//! message listing the outstanding steps for reviews that are incomplete
//! and not completed. Two guards keep that message at-most-once per
//! incomplete verdict: an in-memory notified set (fast path within a
//! process lifetime) and the persistent feedback_sent_at stamp in
//! Postgres (survives restarts; only cleared on a transition into
//! incomplete). The stamp is written only after the notifier confirmed
//! the send.

use std::collections::HashSet;

use dropwatch_common::config::{Config, ProjectConfig};
use dropwatch_common::notify::{format_feedback_message, FeedbackSender, SendDisposition};
use dropwatch_common::registry::FeedbackRegistry;
use dropwatch_common::sheet::{parse_tab, SheetClient, SheetRow};
use dropwatch_common::store::find_latest_message_containing;
use dropwatch_common::Result;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

/// Keys of reviews already notified in this process lifetime.
///
/// Keyed by (project, drop number): the same drop number can in principle
/// appear under two projects, and they must be notified independently. An
/// entry is cleared as soon as its row leaves the incomplete state, so the
/// next incomplete verdict notifies again.
#[derive(Debug, Default)]
pub struct NotifiedSet {
    keys: HashSet<(String, String)>,
}

impl NotifiedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, project: &str, drop_number: &str) -> bool {
        self.keys
            .contains(&(project.to_string(), drop_number.to_string()))
    }

    pub fn mark(&mut self, project: &str, drop_number: &str) {
        self.keys
            .insert((project.to_string(), drop_number.to_string()));
    }

    pub fn clear(&mut self, project: &str, drop_number: &str) {
        self.keys
            .remove(&(project.to_string(), drop_number.to_string()));
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Counters from one feedback pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct FeedbackReport {
    pub rows_scanned: u64,
    pub feedback_sent: u64,
    pub skipped_already_notified: u64,
    pub failures: u64,
}

/// One feedback pass over every enabled project that mirrors to a sheet.
///
/// A failure on one row is counted and the scan continues; the function
/// only fails outright when a whole tab cannot be read. In dry-run mode
/// nothing is written to the registry.
pub async fn run_feedback_cycle<R: FeedbackRegistry, N: FeedbackSender>(
    registry: &R,
    sheets: &SheetClient,
    store: &SqlitePool,
    notifier: &N,
    config: &Config,
    notified: &mut NotifiedSet,
    dry_run: bool,
) -> Result<FeedbackReport> {
    let mut report = FeedbackReport::default();

    for project in config.enabled_projects() {
        let Some(tab) = project.sheet_tab.as_deref() else {
            continue;
        };

        let values = sheets.read_tab(tab).await?;
        let rows = parse_tab(&values);
        debug!("{}: {} QA rows in tab {}", project.name, rows.len(), tab);

        for row in &rows {
            report.rows_scanned += 1;
            if let Err(e) =
                process_row(registry, store, notifier, project, row, notified, &mut report, dry_run)
                    .await
            {
                warn!("Feedback for {} failed: {}", row.drop_number, e);
                report.failures += 1;
            }
        }
    }

    Ok(report)
}

/// Handle one parsed QA row: mirror the reviewer's verdict and send
/// feedback when it is owed.
#[allow(clippy::too_many_arguments)]
pub async fn process_row<R: FeedbackRegistry, N: FeedbackSender>(
    registry: &R,
    store: &SqlitePool,
    notifier: &N,
    project: &ProjectConfig,
    row: &SheetRow,
    notified: &mut NotifiedSet,
    report: &mut FeedbackReport,
    dry_run: bool,
) -> Result<()> {
    if !row.flags.needs_feedback() {
        // Leaving the incomplete state re-arms the notification; mirror
        // the cleared/completed verdict so Postgres does not hold a stale
        // incomplete flag.
        notified.clear(&project.name, &row.drop_number);
        if !dry_run {
            if let Err(e) = registry
                .sync_reviewer_flags(&row.drop_number, row.flags.incomplete, row.flags.completed)
                .await
            {
                warn!("Reviewer-flag sync for {} failed: {}", row.drop_number, e);
            }
        }
        return Ok(());
    }

    // Parsing guarantees an incomplete row has at least one unticked step.
    let missing = row.steps.missing_steps();

    if notified.contains(&project.name, &row.drop_number) {
        report.skipped_already_notified += 1;
        return Ok(());
    }

    // Mirror the reviewer's verdict into Postgres. Best-effort: the sheet
    // stays the source for reviewer-owned flags even if this write fails.
    // The sync is a no-op for an unchanged row, so it cannot disturb the
    // feedback stamp below.
    if !dry_run {
        if let Err(e) = registry
            .sync_reviewer_flags(&row.drop_number, true, false)
            .await
        {
            warn!("Reviewer-flag sync for {} failed: {}", row.drop_number, e);
        }
    }

    // Restart guard: the persistent stamp survives where the in-memory set
    // does not.
    if !registry.feedback_due(&row.drop_number).await? {
        debug!("{}: feedback already stamped, skipping", row.drop_number);
        notified.mark(&project.name, &row.drop_number);
        report.skipped_already_notified += 1;
        return Ok(());
    }

    let text = format_feedback_message(&row.drop_number, &missing, &project.name, &row.user);

    // Thread the feedback onto the agent's original drop message when we
    // can find it; a plain group post otherwise.
    let reply_to =
        match find_latest_message_containing(store, &project.group_jid, &row.drop_number).await {
            Ok(message) => message.map(|m| m.id),
            Err(e) => {
                debug!("Reply-target lookup for {} failed: {}", row.drop_number, e);
                None
            }
        };

    match notifier
        .send_feedback(&project.name, &text, reply_to.as_deref())
        .await?
    {
        SendDisposition::Sent => {
            if !dry_run {
                registry.mark_feedback_sent(&row.drop_number).await?;
            }
            notified.mark(&project.name, &row.drop_number);
            report.feedback_sent += 1;
            info!(
                "Feedback sent for {} ({} steps outstanding)",
                row.drop_number,
                missing.len()
            );
        }
        SendDisposition::Previewed => {
            // Dry run: remember in memory so repeated cycles do not spam
            // the log, but leave the persistent stamp untouched.
            notified.mark(&project.name, &row.drop_number);
            report.feedback_sent += 1;
        }
        SendDisposition::SkippedDisabled => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notified_set_is_keyed_per_project() {
        let mut set = NotifiedSet::new();
        set.mark("Velo Test", "DR1748808");
        assert!(set.contains("Velo Test", "DR1748808"));
        assert!(!set.contains("Lawley", "DR1748808"));
        assert!(!set.contains("Velo Test", "DR1748809"));
    }

    #[test]
    fn clearing_rearms_notification() {
        let mut set = NotifiedSet::new();
        set.mark("Velo Test", "DR1748808");
        set.clear("Velo Test", "DR1748808");
        assert!(!set.contains("Velo Test", "DR1748808"));
        assert!(set.is_empty());
    }

    #[test]
    fn clear_of_unknown_key_is_a_noop() {
        let mut set = NotifiedSet::new();
        set.clear("Velo Test", "DR0000000");
        set.mark("Velo Test", "DR1");
        assert_eq!(set.len(), 1);
    }
}
