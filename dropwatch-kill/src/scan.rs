//! Kill-token scanning
//!
//! The token must stand alone as a word: "KILL" triggers, "killer whale
//! sighting" does not. Matching is case-insensitive over a small fixed
//! token set; a multi-word token tolerates any run of whitespace between
//! its words.

use chrono::{DateTime, Utc};
use dropwatch_common::config::Config;
use dropwatch_common::store::fetch_messages_since;
use dropwatch_common::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use sqlx::SqlitePool;

/// Tokens that trigger the emergency stop.
pub const KILL_TOKENS: [&str; 2] = ["KILL", "EMERGENCY STOP"];

static KILL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    let alternatives: Vec<String> = KILL_TOKENS
        .iter()
        .map(|token| regex::escape(token).replace(' ', r"\s+"))
        .collect();
    Regex::new(&format!(r"(?i)\b(?:{})\b", alternatives.join("|")))
        .expect("kill pattern is valid")
});

/// The token found in `text`, uppercased, or `None`.
pub fn find_kill_token(text: &str) -> Option<String> {
    KILL_PATTERN.find(text).map(|m| {
        m.as_str()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_uppercase()
    })
}

/// Full provenance of a kill token, logged before anything is stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillSighting {
    pub token: String,
    pub project: String,
    pub group_jid: String,
    pub sender: String,
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Scan every enabled group for messages newer than `since`. Returns the
/// first kill token found; disabled projects are never read.
pub async fn scan_for_kill(
    store: &SqlitePool,
    config: &Config,
    since: DateTime<Utc>,
) -> Result<Option<KillSighting>> {
    for project in config.enabled_projects() {
        let messages = fetch_messages_since(store, &project.group_jid, since).await?;
        for message in messages {
            if let Some(token) = find_kill_token(&message.content) {
                return Ok(Some(KillSighting {
                    token,
                    project: project.name.clone(),
                    group_jid: project.group_jid.clone(),
                    sender: message.sender,
                    message_id: message.id,
                    timestamp: message.timestamp,
                }));
            }
        }
    }
    Ok(None)
}
