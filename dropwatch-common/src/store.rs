//! Read-only cursor over the WhatsApp bridge's SQLite message mirror
//!
//! The bridge appends every group message to `messages`; this module never
//! writes. Connections use `mode=ro` so a bug here cannot corrupt the
//! bridge's store.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use tracing::{debug, warn};

/// One message from the bridge store. Immutable once written.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    pub chat_jid: String,
    pub sender: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub is_from_me: bool,
}

/// Connect to the message mirror in read-only mode.
///
/// A missing database is a startup configuration error: the bridge has not
/// run yet, and polling an absent store would loop uselessly.
pub async fn connect_readonly(db_path: &Path) -> Result<SqlitePool> {
    if !db_path.exists() {
        return Err(Error::Config(format!(
            "WhatsApp message store not found: {} (is the bridge running?)",
            db_path.display()
        )));
    }

    let db_url = format!("sqlite://{}?mode=ro", db_path.display());
    let pool = SqlitePool::connect(&db_url).await?;
    Ok(pool)
}

/// Fetch inbound messages for one conversation newer than `since`, oldest
/// first. Outbound messages and empty bodies are excluded in the query;
/// rows with unparseable timestamps are skipped with a warning (a data
/// error must never fail the cycle).
pub async fn fetch_messages_since(
    pool: &SqlitePool,
    chat_jid: &str,
    since: DateTime<Utc>,
) -> Result<Vec<Message>> {
    let rows = sqlx::query(
        r#"
        SELECT id, chat_jid, sender, content, timestamp, is_from_me
        FROM messages
        WHERE chat_jid = ?
          AND timestamp > ?
          AND content != ''
          AND content IS NOT NULL
          AND is_from_me = 0
        ORDER BY timestamp ASC
        "#,
    )
    .bind(chat_jid)
    .bind(since.to_rfc3339())
    .fetch_all(pool)
    .await?;

    let mut messages = Vec::with_capacity(rows.len());
    for row in rows {
        match message_from_row(&row) {
            Ok(message) => messages.push(message),
            Err(e) => warn!("Skipping message with invalid row data: {}", e),
        }
    }

    debug!(
        "Retrieved {} new messages for {} since {}",
        messages.len(),
        chat_jid,
        since
    );
    Ok(messages)
}

/// Latest message in a conversation whose body contains `needle`.
///
/// Text containment runs in SQL as an optimization; the caller still treats
/// the result as advisory (used to thread feedback replies onto the original
/// drop post).
pub async fn find_latest_message_containing(
    pool: &SqlitePool,
    chat_jid: &str,
    needle: &str,
) -> Result<Option<Message>> {
    let row = sqlx::query(
        r#"
        SELECT id, chat_jid, sender, content, timestamp, is_from_me
        FROM messages
        WHERE chat_jid = ?
          AND content LIKE ?
        ORDER BY timestamp DESC
        LIMIT 1
        "#,
    )
    .bind(chat_jid)
    .bind(format!("%{}%", needle))
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => match message_from_row(&row) {
            Ok(message) => Ok(Some(message)),
            Err(e) => {
                warn!("Ignoring unparseable message row: {}", e);
                Ok(None)
            }
        },
        None => Ok(None),
    }
}

fn message_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Message> {
    let timestamp_str: String = row.get("timestamp");
    let timestamp = DateTime::parse_from_rfc3339(&timestamp_str)
        .map_err(|e| Error::Data(format!("invalid timestamp {timestamp_str:?}: {e}")))?
        .with_timezone(&Utc);

    let is_from_me: i64 = row.get("is_from_me");

    Ok(Message {
        id: row.get("id"),
        chat_jid: row.get("chat_jid"),
        sender: row.get("sender"),
        content: row.get("content"),
        timestamp,
        is_from_me: is_from_me != 0,
    })
}
