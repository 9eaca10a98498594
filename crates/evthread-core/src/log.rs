//! Structured JSONL logging for thread lifecycle and fatal events.
//!
//! One [`LogEntry`] is one JSON object on one line of stderr. Entries below the
//! threshold from [`crate::config::log_level`] are dropped, except `fatal`
//! entries, which are always written.

use std::io::Write;

use serde::{Deserialize, Serialize};

use crate::directory::{self, ThreadKey};

/// Severity level for log entries. Ordered from most to least verbose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
    /// Threshold only: suppresses everything but `fatal`.
    Off,
}

/// Canonical structured log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub level: LogLevel,
    pub event: String,
    /// Key of the emitting thread (registered or anonymous).
    pub thread_key: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl LogEntry {
    /// Create an entry stamped with the calling thread's identity.
    #[must_use]
    pub fn new(level: LogLevel, event: impl Into<String>) -> Self {
        let current = directory::current();
        Self {
            timestamp: now_utc(),
            level,
            event: event.into(),
            thread_key: current
                .as_ref()
                .map_or_else(directory::current_key, |t| t.key())
                .get(),
            thread_name: current.map(|t| t.name().to_owned()),
            details: None,
        }
    }

    /// Attribute the entry to a specific thread instead of the caller.
    #[must_use]
    pub fn with_thread(mut self, key: ThreadKey, name: &str) -> Self {
        self.thread_key = key.get();
        self.thread_name = Some(name.to_owned());
        self
    }

    /// Attach free-form details.
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Serialize as a single JSONL line (no trailing newline).
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Returns true if an entry at `level` passes the configured threshold.
#[must_use]
pub fn enabled(level: LogLevel) -> bool {
    level == LogLevel::Fatal || (level != LogLevel::Off && level >= crate::config::log_level())
}

/// Write `entry` to stderr if its level is enabled.
pub fn emit(entry: &LogEntry) {
    if !enabled(entry.level) {
        return;
    }
    if let Ok(line) = entry.to_jsonl() {
        let stderr = std::io::stderr();
        let mut out = stderr.lock();
        let _ = writeln!(out, "{line}");
    }
}

fn now_utc() -> String {
    let duration = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let secs = duration.as_secs();
    let (year, month, day) = civil_from_days((secs / 86_400) as i64);
    format!(
        "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}.{:03}Z",
        (secs % 86_400) / 3600,
        (secs % 3600) / 60,
        secs % 60,
        duration.subsec_millis(),
    )
}

/// Days since 1970-01-01 to a proleptic Gregorian (year, month, day).
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}
