//! Resubmission scan tests: keyword+identifier pairing drives the registry
//! reset, and plain chatter passes through untouched.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use dropwatch_common::config::Config;
use dropwatch_common::extract::DropSighting;
use dropwatch_common::registry::{DropRegistry, RegisterOutcome};
use dropwatch_common::state::MonitorState;
use dropwatch_common::Result;
use dropwatch_qa::resubmission::run_resubmission_cycle;
use sqlx::SqlitePool;

const GROUP: &str = "120363421664266245@g.us";

#[derive(Default)]
struct MemRegistry {
    resubmissions: Mutex<HashMap<String, Vec<String>>>,
}

impl MemRegistry {
    fn notes_for(&self, drop_number: &str) -> Vec<String> {
        self.resubmissions
            .lock()
            .unwrap()
            .get(drop_number)
            .cloned()
            .unwrap_or_default()
    }

    fn total(&self) -> usize {
        self.resubmissions.lock().unwrap().values().map(Vec::len).sum()
    }
}

impl DropRegistry for MemRegistry {
    async fn register(&self, _sighting: &DropSighting, _project: &str) -> Result<RegisterOutcome> {
        unreachable!("resubmission scan never registers new drops")
    }

    async fn record_resubmission(
        &self,
        drop_number: &str,
        _contractor: &str,
        _project: &str,
        note: &str,
    ) -> Result<()> {
        self.resubmissions
            .lock()
            .unwrap()
            .entry(drop_number.to_string())
            .or_default()
            .push(note.to_string());
        Ok(())
    }
}

fn test_config() -> Config {
    toml::from_str(&format!(
        r#"
messages_db = "unused.db"
postgres_url = "postgres://unused"

[[projects]]
name = "Velo Test"
group_jid = "{GROUP}"
group_name = "Velo Test"
"#
    ))
    .unwrap()
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

async fn post(pool: &SqlitePool, id: &str, content: &str, at: DateTime<Utc>) {
    sqlx::query("INSERT INTO messages (id, chat_jid, sender, content, timestamp, is_from_me) VALUES (?, ?, ?, ?, ?, 0)")
        .bind(id)
        .bind(GROUP)
        .bind("27821234567@s.whatsapp.net")
        .bind(content)
        .bind(at.to_rfc3339())
        .execute(pool)
        .await
        .unwrap();
}

fn state_from(since: DateTime<Utc>) -> MonitorState {
    let mut state = MonitorState::default_state();
    state.last_check_time = since;
    state.processed_message_ids.clear();
    state
}

#[tokio::test]
async fn keyword_with_drop_number_records_resubmission() {
    let pool = mirror_pool().await;
    let registry = MemRegistry::default();
    let config = test_config();
    let base = Utc::now() - Duration::minutes(30);

    post(&pool, "m1", "DR1748808 updated, please re-check", base + Duration::minutes(1)).await;

    let mut state = state_from(base);
    let report = run_resubmission_cycle(&pool, &registry, None, &config, &mut state, false)
        .await
        .unwrap();

    assert_eq!(report.resubmissions, 1);
    let notes = registry.notes_for("DR1748808");
    assert_eq!(notes.len(), 1);
    assert!(notes[0].contains("WhatsApp-"));
}

#[tokio::test]
async fn keyword_without_identifier_is_ignored() {
    let pool = mirror_pool().await;
    let registry = MemRegistry::default();
    let config = test_config();
    let base = Utc::now() - Duration::minutes(30);
    let t1 = base + Duration::minutes(1);

    post(&pool, "m1", "all done for today, heading home", t1).await;

    let mut state = state_from(base);
    let report = run_resubmission_cycle(&pool, &registry, None, &config, &mut state, false)
        .await
        .unwrap();

    assert_eq!(report.resubmissions, 0);
    assert_eq!(registry.total(), 0);
    // Still consumed: the watermark moves past non-actionable chatter.
    assert_eq!(state.last_check_time, t1);
    assert!(state.is_processed("m1"));
}

#[tokio::test]
async fn identifier_without_keyword_is_ignored() {
    let pool = mirror_pool().await;
    let registry = MemRegistry::default();
    let config = test_config();
    let base = Utc::now() - Duration::minutes(30);

    post(&pool, "m1", "DR1748808 installed this morning", base + Duration::minutes(1)).await;

    let mut state = state_from(base);
    let report = run_resubmission_cycle(&pool, &registry, None, &config, &mut state, false)
        .await
        .unwrap();

    assert_eq!(report.resubmissions, 0);
    assert_eq!(registry.total(), 0);
}

#[tokio::test]
async fn dry_run_records_nothing() {
    let pool = mirror_pool().await;
    let registry = MemRegistry::default();
    let config = test_config();
    let base = Utc::now() - Duration::minutes(30);

    post(&pool, "m1", "resubmitted DR1748808", base + Duration::minutes(1)).await;

    let mut state = state_from(base);
    run_resubmission_cycle(&pool, &registry, None, &config, &mut state, true)
        .await
        .unwrap();
    assert_eq!(registry.total(), 0);
}
