//! Monitor self-health reporting
//!
//! Each monitor writes a small JSON health file alongside its state file so
//! operators (and the service supervisor) can see when it last completed a
//! cycle and how many errors it has hit. The file is observational only;
//! nothing reads it back for control flow.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use tracing::error;

#[derive(Debug, Serialize)]
struct HealthSnapshot<'a> {
    start_time: DateTime<Utc>,
    last_successful_check: Option<DateTime<Utc>>,
    messages_processed_count: u64,
    errors_count: u64,
    last_error: Option<&'a str>,
    uptime_seconds: i64,
}

/// Running health counters for one monitor process.
#[derive(Debug)]
pub struct MonitorHealth {
    path: PathBuf,
    start_time: DateTime<Utc>,
    last_successful_check: Option<DateTime<Utc>>,
    pub messages_processed_count: u64,
    pub errors_count: u64,
    last_error: Option<String>,
}

impl MonitorHealth {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            start_time: Utc::now(),
            last_successful_check: None,
            messages_processed_count: 0,
            errors_count: 0,
            last_error: None,
        }
    }

    pub fn record_success(&mut self, processed: u64) {
        self.last_successful_check = Some(Utc::now());
        self.messages_processed_count += processed;
        self.write();
    }

    pub fn record_error(&mut self, message: &str) {
        self.errors_count += 1;
        self.last_error = Some(message.to_string());
        self.write();
    }

    /// A failed health write must never take the monitor down.
    fn write(&self) {
        let snapshot = HealthSnapshot {
            start_time: self.start_time,
            last_successful_check: self.last_successful_check,
            messages_processed_count: self.messages_processed_count,
            errors_count: self.errors_count,
            last_error: self.last_error.as_deref(),
            uptime_seconds: (Utc::now() - self.start_time).num_seconds(),
        };
        let result = serde_json::to_string_pretty(&snapshot)
            .map_err(crate::Error::from)
            .and_then(|json| std::fs::write(&self.path, json).map_err(crate::Error::from));
        if let Err(e) = result {
            error!("Failed to save health data: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn records_counts_and_writes_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("monitor_health.json");
        let mut health = MonitorHealth::new(path.clone());

        health.record_success(3);
        health.record_error("postgres timeout");
        health.record_success(1);

        assert_eq!(health.messages_processed_count, 4);
        assert_eq!(health.errors_count, 1);

        let written = std::fs::read_to_string(&path).unwrap();
        let json: serde_json::Value = serde_json::from_str(&written).unwrap();
        assert_eq!(json["messages_processed_count"], 4);
        assert_eq!(json["last_error"], "postgres timeout");
        assert!(json["last_successful_check"].is_string());
    }
}
