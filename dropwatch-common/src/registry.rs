//! Installation registry and QA review store (Postgres)
//!
//! The relational store is the single writable source of truth for
//! installations. Every drop number gets exactly one `installations` row,
//! enforced by the primary key: insert-or-skip (`ON CONFLICT DO NOTHING`)
//! is the arbiter between racing monitor instances, and a conflict is
//! treated as "already exists, proceed as resubmission".
//!
//! The reconciler only needs the small [`DropRegistry`] seam, which keeps
//! its cycle logic testable without a live Postgres.

use crate::extract::DropSighting;
use crate::qa::{ChecklistSteps, STEP_COLUMNS, STEP_COUNT};
use crate::Result;
use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::{debug, info};

/// Result of offering one sighting to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// First sighting: installation and blank QA review created.
    Created,
    /// Drop number already registered; caller records a resubmission.
    AlreadyRegistered,
}

/// The registry operations the reconciler cycle depends on. Each method is
/// one atomic unit: either all of its writes land or none do.
///
/// Monitors are single-threaded polling loops, so the futures carry no Send
/// bound.
#[allow(async_fn_in_trait)]
pub trait DropRegistry {
    /// Insert-or-skip the installation for a first sighting, creating the
    /// blank QA review alongside it in the same transaction.
    async fn register(&self, sighting: &DropSighting, project: &str) -> Result<RegisterOutcome>;

    /// Record a resubmission for an existing drop: append the note to the
    /// installation, flip its status, reset the QA flags for a fresh review
    /// cycle, and clear the feedback stamp. Creates the missing QA review
    /// half if it does not exist.
    async fn record_resubmission(
        &self,
        drop_number: &str,
        contractor: &str,
        project: &str,
        note: &str,
    ) -> Result<()>;
}

/// The review-store operations the feedback cycle depends on: mirroring the
/// reviewer's sheet verdict and the at-most-once notification guard.
#[allow(async_fn_in_trait)]
pub trait FeedbackRegistry {
    /// Mirror the reviewer's incomplete/completed verdict from the sheet.
    /// Must be a no-op when the stored flags already match, and may only
    /// clear the feedback stamp on a transition into incomplete; otherwise
    /// every scan of an unchanged row would re-arm the notification.
    /// Returns whether anything changed.
    async fn sync_reviewer_flags(
        &self,
        drop_number: &str,
        incomplete: bool,
        completed: bool,
    ) -> Result<bool>;

    /// Whether feedback is still owed for the current incomplete verdict.
    async fn feedback_due(&self, drop_number: &str) -> Result<bool>;

    /// Stamp the review after the notifier confirmed the send.
    async fn mark_feedback_sent(&self, drop_number: &str) -> Result<()>;
}

/// Postgres-backed registry.
#[derive(Clone)]
pub struct PgRegistry {
    pool: PgPool,
}

impl PgRegistry {
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Cheap connectivity probe used by startup checks.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Create tables if they do not exist (idempotent, safe on every start).
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS installations (
                drop_number TEXT PRIMARY KEY,
                contractor_name TEXT NOT NULL,
                project_name TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'submitted',
                agent_notes TEXT NOT NULL DEFAULT '',
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        let step_columns: String = STEP_COLUMNS
            .iter()
            .map(|col| format!("{col} BOOLEAN NOT NULL DEFAULT FALSE,\n"))
            .collect();
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS qa_reviews (
                drop_number TEXT NOT NULL,
                review_date DATE NOT NULL DEFAULT CURRENT_DATE,
                user_name TEXT NOT NULL DEFAULT '',
                project TEXT NOT NULL DEFAULT '',
                {step_columns}
                incomplete BOOLEAN NOT NULL DEFAULT FALSE,
                resubmitted BOOLEAN NOT NULL DEFAULT FALSE,
                completed BOOLEAN NOT NULL DEFAULT FALSE,
                feedback_sent_at TIMESTAMPTZ,
                comment TEXT NOT NULL DEFAULT '',
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (drop_number, review_date)
            )
            "#
        ))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn insert_blank_review(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        drop_number: &str,
        user_name: &str,
        project: &str,
        comment: &str,
    ) -> Result<()> {
        let steps = ChecklistSteps::all_false();
        let step_columns = STEP_COLUMNS.join(", ");
        let step_values: Vec<String> = (0..STEP_COUNT)
            .map(|i| if steps.0[i] { "TRUE" } else { "FALSE" }.to_string())
            .collect();
        let sql = format!(
            r#"
            INSERT INTO qa_reviews (drop_number, review_date, user_name, project, {step_columns}, comment)
            VALUES ($1, CURRENT_DATE, $2, $3, {}, $4)
            ON CONFLICT (drop_number, review_date) DO UPDATE SET
                incomplete = FALSE,
                resubmitted = TRUE,
                completed = FALSE,
                feedback_sent_at = NULL,
                comment = qa_reviews.comment || E'\n' || EXCLUDED.comment,
                updated_at = now()
            "#,
            step_values.join(", ")
        );
        sqlx::query(&sql)
            .bind(drop_number)
            .bind(user_name)
            .bind(project)
            .bind(comment)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}

impl DropRegistry for PgRegistry {
    async fn register(&self, sighting: &DropSighting, project: &str) -> Result<RegisterOutcome> {
        let contractor = sighting.contractor_name();
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO installations
                (drop_number, contractor_name, project_name, status, created_at, updated_at)
            VALUES ($1, $2, $3, 'submitted', $4, now())
            ON CONFLICT (drop_number) DO NOTHING
            "#,
        )
        .bind(&sighting.drop_number)
        .bind(&contractor)
        .bind(project)
        .bind(sighting.timestamp)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            // Existing drop; the caller decides on the resubmission path.
            tx.rollback().await?;
            return Ok(RegisterOutcome::AlreadyRegistered);
        }

        let user_name = contractor.trim_start_matches("WhatsApp-").to_string();
        Self::insert_blank_review(&mut tx, &sighting.drop_number, &user_name, project, "").await?;

        tx.commit().await?;
        info!("Created installation and QA review for {}", sighting.drop_number);
        Ok(RegisterOutcome::Created)
    }

    async fn record_resubmission(
        &self,
        drop_number: &str,
        contractor: &str,
        project: &str,
        note: &str,
    ) -> Result<()> {
        let stamped_note = format!(
            "\n--- RESUBMITTED {} ---\n{}\n",
            Utc::now().format("%Y-%m-%d %H:%M:%S"),
            note
        );
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE installations
            SET status = 'resubmitted',
                agent_notes = agent_notes || $2,
                updated_at = now()
            WHERE drop_number = $1
            "#,
        )
        .bind(drop_number)
        .bind(&stamped_note)
        .execute(&mut *tx)
        .await?;

        let reset = sqlx::query(
            r#"
            UPDATE qa_reviews
            SET incomplete = FALSE,
                resubmitted = TRUE,
                completed = FALSE,
                feedback_sent_at = NULL,
                comment = comment || $2,
                updated_at = now()
            WHERE drop_number = $1
            "#,
        )
        .bind(drop_number)
        .bind(&stamped_note)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if reset == 0 {
            // Registry row without a review: create the missing half.
            let user_name = contractor.trim_start_matches("WhatsApp-").to_string();
            Self::insert_blank_review(&mut tx, drop_number, &user_name, project, &stamped_note)
                .await?;
        }

        tx.commit().await?;
        info!("Recorded resubmission for {}", drop_number);
        Ok(())
    }
}

impl FeedbackRegistry for PgRegistry {
    /// Sheet-to-Postgres direction of the mirror. The WHERE clause makes a
    /// scan of an unchanged row a true no-op, and the stamp is cleared only
    /// on the transition into incomplete: a restart mid-verdict must not
    /// null the stamp and re-send. A missing review row is not an error;
    /// the sheet remains the reviewer's source.
    async fn sync_reviewer_flags(
        &self,
        drop_number: &str,
        incomplete: bool,
        completed: bool,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE qa_reviews
            SET feedback_sent_at = CASE
                    WHEN $2 AND NOT incomplete THEN NULL
                    ELSE feedback_sent_at
                END,
                incomplete = $2,
                completed = $3,
                updated_at = now()
            WHERE drop_number = $1
              AND (incomplete IS DISTINCT FROM $2 OR completed IS DISTINCT FROM $3)
            "#,
        )
        .bind(drop_number)
        .bind(incomplete)
        .bind(completed)
        .execute(&self.pool)
        .await?;

        let updated = result.rows_affected() > 0;
        if updated {
            debug!(
                "Synced reviewer flags for {}: incomplete={}, completed={}",
                drop_number, incomplete, completed
            );
        }
        Ok(updated)
    }

    /// At-most-once guard: feedback is due while the stamp is null or older
    /// than the review's last update.
    async fn feedback_due(&self, drop_number: &str) -> Result<bool> {
        let row = sqlx::query(
            r#"
            SELECT (feedback_sent_at IS NULL OR feedback_sent_at < updated_at) AS due
            FROM qa_reviews
            WHERE drop_number = $1 AND completed = FALSE
            ORDER BY review_date DESC
            LIMIT 1
            "#,
        )
        .bind(drop_number)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.get::<bool, _>("due")).unwrap_or(true))
    }

    async fn mark_feedback_sent(&self, drop_number: &str) -> Result<()> {
        sqlx::query(
            "UPDATE qa_reviews SET feedback_sent_at = now() WHERE drop_number = $1",
        )
        .bind(drop_number)
        .execute(&self.pool)
        .await?;
        info!("Marked feedback sent for {}", drop_number);
        Ok(())
    }
}
