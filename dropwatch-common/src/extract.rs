//! Drop-number extraction from raw message text
//!
//! Drop numbers are the primary correlation key across all stores: the
//! literal prefix "DR" (case-insensitive) followed by one or more decimal
//! digits. Observed formats vary between 6 and 7 digits; no length bound is
//! enforced here and no semantic validation is attempted.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

static DROP_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)DR\d+").expect("drop pattern is valid")
});

/// A drop number sighted in a message, with its originating metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropSighting {
    /// Normalized (uppercase) drop number, e.g. "DR1748808"
    pub drop_number: String,
    pub message_id: String,
    pub chat_jid: String,
    pub sender: String,
    pub timestamp: DateTime<Utc>,
}

impl DropSighting {
    /// Contractor label derived from the sender, as stored on the
    /// installation record.
    pub fn contractor_name(&self) -> String {
        contractor_label(&self.sender)
    }
}

/// Contractor label for a raw sender JID, truncated to keep the
/// installation column readable.
pub fn contractor_label(sender: &str) -> String {
    let short: String = sender.chars().take(20).collect();
    if sender.chars().count() > 20 {
        format!("WhatsApp-{short}...")
    } else {
        format!("WhatsApp-{short}")
    }
}

/// Extract the ordered list of distinct, uppercased drop numbers in `text`.
///
/// Pure function; calling it repeatedly on the same message is safe.
pub fn extract_drop_numbers(text: &str) -> Vec<String> {
    let mut found = Vec::new();
    for m in DROP_PATTERN.find_iter(text) {
        let normalized = m.as_str().to_uppercase();
        if !found.contains(&normalized) {
            found.push(normalized);
        }
    }
    found
}
