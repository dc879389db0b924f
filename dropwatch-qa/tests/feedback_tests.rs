//! Feedback-guard tests against in-memory review and sender stands-ins:
//! one notification per incomplete verdict, surviving restarts, with no
//! registry writes in dry-run mode.

use std::collections::HashMap;
use std::sync::Mutex;

use dropwatch_common::config::ProjectConfig;
use dropwatch_common::notify::{FeedbackSender, SendDisposition};
use dropwatch_common::qa::{ChecklistSteps, ReviewFlags, STEP_COUNT};
use dropwatch_common::registry::FeedbackRegistry;
use dropwatch_common::sheet::SheetRow;
use dropwatch_common::Result;
use dropwatch_qa::feedback::{process_row, FeedbackReport, NotifiedSet};
use sqlx::SqlitePool;

const GROUP: &str = "120363421664266245@g.us";

#[derive(Debug, Clone)]
struct MemReview {
    incomplete: bool,
    completed: bool,
    /// Logical-clock stand-ins for feedback_sent_at / updated_at.
    stamp: Option<u64>,
    updated_at: u64,
}

/// In-memory review store with the same stamp semantics as the Postgres
/// registry: flag sync is a no-op for unchanged flags and only clears the
/// stamp on a transition into incomplete.
#[derive(Default)]
struct MemReviews {
    reviews: Mutex<HashMap<String, MemReview>>,
    clock: Mutex<u64>,
    sync_writes: Mutex<u64>,
}

impl MemReviews {
    fn tick(&self) -> u64 {
        let mut clock = self.clock.lock().unwrap();
        *clock += 1;
        *clock
    }

    fn seed_blank(&self, drop_number: &str) {
        self.reviews.lock().unwrap().insert(
            drop_number.to_string(),
            MemReview {
                incomplete: false,
                completed: false,
                stamp: None,
                updated_at: 0,
            },
        );
    }

    fn review(&self, drop_number: &str) -> MemReview {
        self.reviews.lock().unwrap().get(drop_number).cloned().unwrap()
    }

    fn sync_write_count(&self) -> u64 {
        *self.sync_writes.lock().unwrap()
    }
}

impl FeedbackRegistry for MemReviews {
    async fn sync_reviewer_flags(
        &self,
        drop_number: &str,
        incomplete: bool,
        completed: bool,
    ) -> Result<bool> {
        let now = self.tick();
        let mut reviews = self.reviews.lock().unwrap();
        let Some(review) = reviews.get_mut(drop_number) else {
            return Ok(false);
        };
        if review.incomplete == incomplete && review.completed == completed {
            return Ok(false);
        }
        if incomplete && !review.incomplete {
            review.stamp = None;
        }
        review.incomplete = incomplete;
        review.completed = completed;
        review.updated_at = now;
        *self.sync_writes.lock().unwrap() += 1;
        Ok(true)
    }

    async fn feedback_due(&self, drop_number: &str) -> Result<bool> {
        let reviews = self.reviews.lock().unwrap();
        Ok(match reviews.get(drop_number) {
            Some(review) if !review.completed => {
                review.stamp.map_or(true, |stamp| stamp < review.updated_at)
            }
            _ => true,
        })
    }

    async fn mark_feedback_sent(&self, drop_number: &str) -> Result<()> {
        let now = self.tick();
        if let Some(review) = self.reviews.lock().unwrap().get_mut(drop_number) {
            review.stamp = Some(now);
        }
        Ok(())
    }
}

/// Records every send; disposition is configurable so dry-run previews can
/// be exercised too.
struct MemSender {
    disposition: SendDisposition,
    sent: Mutex<Vec<String>>,
}

impl MemSender {
    fn new(disposition: SendDisposition) -> Self {
        Self {
            disposition,
            sent: Mutex::new(Vec::new()),
        }
    }

    fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

impl FeedbackSender for MemSender {
    async fn send_feedback(
        &self,
        _project: &str,
        text: &str,
        _reply_to: Option<&str>,
    ) -> Result<SendDisposition> {
        self.sent.lock().unwrap().push(text.to_string());
        Ok(self.disposition)
    }
}

fn velo_project() -> ProjectConfig {
    ProjectConfig {
        name: "Velo Test".to_string(),
        group_jid: GROUP.to_string(),
        group_name: "Velo Test".to_string(),
        sheet_tab: Some("Velo Test".to_string()),
        enabled: true,
    }
}

fn qa_row(drop_number: &str, steps_done: usize, incomplete: bool, completed: bool) -> SheetRow {
    let mut steps = ChecklistSteps::all_false();
    for i in 0..steps_done.min(STEP_COUNT) {
        steps.0[i] = true;
    }
    SheetRow {
        row_number: 3,
        drop_number: drop_number.to_string(),
        date: "2025-10-02".to_string(),
        steps,
        user: "Morne".to_string(),
        comment: String::new(),
        flags: ReviewFlags {
            incomplete,
            resubmitted: false,
            completed,
        },
    }
}

async fn mirror_pool() -> SqlitePool {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::query(
        r#"
        CREATE TABLE messages (
            id TEXT PRIMARY KEY,
            chat_jid TEXT NOT NULL,
            sender TEXT NOT NULL,
            content TEXT,
            timestamp TEXT NOT NULL,
            is_from_me INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(&pool)
    .await
    .unwrap();
    pool
}

#[tokio::test]
async fn incomplete_verdict_notifies_exactly_once_across_restarts() {
    let pool = mirror_pool().await;
    let reviews = MemReviews::default();
    let sender = MemSender::new(SendDisposition::Sent);
    let project = velo_project();
    let row = qa_row("DR1748808", 12, true, false);
    reviews.seed_blank("DR1748808");

    let mut notified = NotifiedSet::new();
    let mut report = FeedbackReport::default();
    process_row(&reviews, &pool, &sender, &project, &row, &mut notified, &mut report, false)
        .await
        .unwrap();
    assert_eq!(sender.sent_count(), 1);
    assert!(reviews.review("DR1748808").stamp.is_some());

    // Restart: the in-memory notified set is gone, the row is unchanged.
    // The persistent stamp alone must suppress a second message.
    let mut notified = NotifiedSet::new();
    let mut report = FeedbackReport::default();
    process_row(&reviews, &pool, &sender, &project, &row, &mut notified, &mut report, false)
        .await
        .unwrap();
    assert_eq!(sender.sent_count(), 1);
    assert_eq!(report.skipped_already_notified, 1);
}

#[tokio::test]
async fn fresh_incomplete_verdict_notifies_again() {
    let pool = mirror_pool().await;
    let reviews = MemReviews::default();
    let sender = MemSender::new(SendDisposition::Sent);
    let project = velo_project();
    reviews.seed_blank("DR1748808");

    let mut notified = NotifiedSet::new();
    let mut report = FeedbackReport::default();

    let row = qa_row("DR1748808", 12, true, false);
    process_row(&reviews, &pool, &sender, &project, &row, &mut notified, &mut report, false)
        .await
        .unwrap();
    assert_eq!(sender.sent_count(), 1);

    // Reviewer clears the incomplete flag, then flags the row again.
    let cleared = qa_row("DR1748808", 12, false, false);
    process_row(&reviews, &pool, &sender, &project, &cleared, &mut notified, &mut report, false)
        .await
        .unwrap();
    assert_eq!(sender.sent_count(), 1);
    assert!(!reviews.review("DR1748808").incomplete);

    process_row(&reviews, &pool, &sender, &project, &row, &mut notified, &mut report, false)
        .await
        .unwrap();
    assert_eq!(sender.sent_count(), 2);
}

#[tokio::test]
async fn completed_verdict_is_mirrored_to_the_review_store() {
    let pool = mirror_pool().await;
    let reviews = MemReviews::default();
    let sender = MemSender::new(SendDisposition::Sent);
    let project = velo_project();
    reviews.seed_blank("DR1748808");

    let mut notified = NotifiedSet::new();
    let mut report = FeedbackReport::default();

    let row = qa_row("DR1748808", 12, true, false);
    process_row(&reviews, &pool, &sender, &project, &row, &mut notified, &mut report, false)
        .await
        .unwrap();
    assert!(reviews.review("DR1748808").incomplete);

    let completed = qa_row("DR1748808", 14, false, true);
    process_row(&reviews, &pool, &sender, &project, &completed, &mut notified, &mut report, false)
        .await
        .unwrap();
    let review = reviews.review("DR1748808");
    assert!(review.completed);
    assert!(!review.incomplete);
}

#[tokio::test]
async fn dry_run_never_writes_to_the_review_store() {
    let pool = mirror_pool().await;
    let reviews = MemReviews::default();
    let sender = MemSender::new(SendDisposition::Previewed);
    let project = velo_project();
    reviews.seed_blank("DR1748808");

    let mut notified = NotifiedSet::new();
    let mut report = FeedbackReport::default();

    let row = qa_row("DR1748808", 12, true, false);
    process_row(&reviews, &pool, &sender, &project, &row, &mut notified, &mut report, true)
        .await
        .unwrap();

    let review = reviews.review("DR1748808");
    assert!(!review.incomplete);
    assert!(review.stamp.is_none());
    assert_eq!(reviews.sync_write_count(), 0);
    assert_eq!(report.feedback_sent, 1);
}
