//! Durable dedup / watermark state for a monitor process
//!
//! Each monitor keeps one JSON state file holding the timestamp boundary
//! below which all messages are considered processed, plus a bounded set of
//! recently seen message ids. The file is written via temp-then-rename so a
//! crash mid-write leaves the previous state intact, and it is only written
//! after a successful cycle: a failed cycle re-reads the same window next
//! time and the seen-id set makes the re-scan idempotent.

use crate::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, warn};

/// Hours of look-back used when no prior state exists.
const DEFAULT_LOOKBACK_HOURS: i64 = 2;

/// Cap on retained message ids; oldest entries are evicted first.
const MAX_PROCESSED_IDS: usize = 2000;

const STATE_VERSION: &str = "2.0";

/// Persistent monitor state: watermark plus recently processed message ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorState {
    pub last_check_time: DateTime<Utc>,
    /// Insertion-ordered so truncation evicts the oldest entries.
    #[serde(default)]
    pub processed_message_ids: Vec<String>,
    #[serde(default)]
    pub saved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub version: Option<String>,
}

impl MonitorState {
    /// Safe default: look back two hours to catch anything missed, no seen ids.
    pub fn default_state() -> Self {
        let start = Utc::now() - Duration::hours(DEFAULT_LOOKBACK_HOURS);
        info!("Using default start time: {}", start);
        Self {
            last_check_time: start,
            processed_message_ids: Vec::new(),
            saved_at: None,
            version: None,
        }
    }

    /// Load state from `path`, falling back to the default on a missing
    /// file, a structurally invalid file, or a watermark in the future.
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            return Self::default_state();
        }

        let state: MonitorState = match std::fs::read_to_string(path)
            .map_err(crate::Error::from)
            .and_then(|text| serde_json::from_str(&text).map_err(crate::Error::from))
        {
            Ok(state) => state,
            Err(e) => {
                warn!("Failed to load state from {}: {}, using defaults", path.display(), e);
                return Self::default_state();
            }
        };

        // Sanity check: never start from the future
        if state.last_check_time > Utc::now() {
            warn!(
                "State watermark in future ({}), resetting",
                state.last_check_time
            );
            return Self::default_state();
        }

        info!(
            "Loaded state: last_check={}, processed_ids={}",
            state.last_check_time,
            state.processed_message_ids.len()
        );
        state
    }

    /// Persist atomically (write temp file, then rename over `path`).
    ///
    /// The id set is truncated to the most recent entries before writing.
    pub fn save(&mut self, path: &Path) -> Result<()> {
        if self.processed_message_ids.len() > MAX_PROCESSED_IDS {
            let excess = self.processed_message_ids.len() - MAX_PROCESSED_IDS;
            self.processed_message_ids.drain(..excess);
        }
        self.saved_at = Some(Utc::now());
        self.version = Some(STATE_VERSION.to_string());

        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;

        debug!("State saved: last_check={}", self.last_check_time);
        Ok(())
    }

    pub fn is_processed(&self, message_id: &str) -> bool {
        self.processed_message_ids.iter().any(|id| id == message_id)
    }

    /// Record a handled message id; duplicates are not re-added.
    pub fn mark_processed(&mut self, message_id: &str) {
        if !self.is_processed(message_id) {
            self.processed_message_ids.push(message_id.to_string());
        }
    }

    /// Advance the watermark, never moving it backwards.
    pub fn advance_watermark(&mut self, to: DateTime<Utc>) {
        if to > self.last_check_time {
            self.last_check_time = to;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn state_path(dir: &TempDir) -> std::path::PathBuf {
        dir.path().join("monitor_state.json")
    }

    #[test]
    fn missing_file_yields_lookback_default() {
        let dir = TempDir::new().unwrap();
        let state = MonitorState::load(&state_path(&dir));
        let age = Utc::now() - state.last_check_time;
        assert!(age >= Duration::hours(2) - Duration::minutes(1));
        assert!(age <= Duration::hours(2) + Duration::minutes(1));
        assert!(state.processed_message_ids.is_empty());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = state_path(&dir);

        let mut state = MonitorState::default_state();
        state.mark_processed("3A5E1B");
        state.mark_processed("3A5E1C");
        let watermark = state.last_check_time;
        state.save(&path).unwrap();

        let loaded = MonitorState::load(&path);
        assert_eq!(loaded.last_check_time, watermark);
        assert!(loaded.is_processed("3A5E1B"));
        assert!(loaded.is_processed("3A5E1C"));
        assert!(!loaded.is_processed("3A5E1D"));
    }

    #[test]
    fn corrupt_file_resets_to_default() {
        let dir = TempDir::new().unwrap();
        let path = state_path(&dir);
        std::fs::write(&path, "{not json").unwrap();

        let state = MonitorState::load(&path);
        assert!(state.processed_message_ids.is_empty());
    }

    #[test]
    fn future_watermark_resets_to_default() {
        let dir = TempDir::new().unwrap();
        let path = state_path(&dir);

        let mut state = MonitorState::default_state();
        state.last_check_time = Utc::now() + Duration::hours(48);
        state.save(&path).unwrap();

        let loaded = MonitorState::load(&path);
        assert!(loaded.last_check_time <= Utc::now());
    }

    #[test]
    fn save_truncates_to_most_recent_ids() {
        let dir = TempDir::new().unwrap();
        let path = state_path(&dir);

        let mut state = MonitorState::default_state();
        for i in 0..2500 {
            state.mark_processed(&format!("msg-{i}"));
        }
        state.save(&path).unwrap();

        let loaded = MonitorState::load(&path);
        assert_eq!(loaded.processed_message_ids.len(), 2000);
        // Oldest evicted, newest kept
        assert!(!loaded.is_processed("msg-0"));
        assert!(loaded.is_processed("msg-2499"));
    }

    #[test]
    fn watermark_never_moves_backwards() {
        let mut state = MonitorState::default_state();
        let current = state.last_check_time;
        state.advance_watermark(current - Duration::hours(1));
        assert_eq!(state.last_check_time, current);
        let later = current + Duration::minutes(5);
        state.advance_watermark(later);
        assert_eq!(state.last_check_time, later);
    }
}
