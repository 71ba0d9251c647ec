//! Logging setup using tracing, plus the bounded per-session log.
//!
//! Library code logs through `tracing`. A connection additionally keeps a
//! [`SessionLog`]: a short, ordered history of what happened to it, suitable
//! for showing in an inspector UI. Every accepted session entry is mirrored to
//! `tracing` first.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt::Display;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Maximum number of entries retained by a [`SessionLog`].
pub const MAX_LOG_ENTRIES: usize = 100;

/// Log level configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    /// Parse a log level from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

impl Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single entry in a session log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Bounded, append-only log of a single connection.
///
/// Debug entries are dropped unless the log was created with `debug = true`.
/// Accepted entries always go to `tracing`; they are only retained while the
/// log is mounted. At most [`MAX_LOG_ENTRIES`] are kept, oldest dropped first.
#[derive(Debug)]
pub struct SessionLog {
    debug: bool,
    mounted: AtomicBool,
    entries: Mutex<VecDeque<LogEntry>>,
}

impl SessionLog {
    /// Create a mounted session log.
    pub fn new(debug: bool) -> Self {
        Self {
            debug,
            mounted: AtomicBool::new(true),
            entries: Mutex::new(VecDeque::with_capacity(MAX_LOG_ENTRIES)),
        }
    }

    /// Whether debug entries are accepted.
    pub fn debug_enabled(&self) -> bool {
        self.debug
    }

    /// Mark the owner as mounted or unmounted.
    pub fn set_mounted(&self, mounted: bool) {
        self.mounted.store(mounted, Ordering::SeqCst);
    }

    /// Whether the owner is still mounted.
    pub fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::SeqCst)
    }

    /// Record a message.
    ///
    /// Returns `true` when the entry was retained, i.e. the caller has a new
    /// log to publish.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) -> bool {
        let message = message.into();
        if level == LogLevel::Debug && !self.debug {
            return false;
        }

        mirror(level, &message);

        if !self.is_mounted() {
            return false;
        }

        let mut entries = self.lock();
        if entries.len() >= MAX_LOG_ENTRIES {
            entries.pop_front();
        }
        entries.push_back(LogEntry {
            level,
            message,
            timestamp: Utc::now(),
        });
        true
    }

    /// Record a message followed by extra context values.
    pub fn log_with<I, D>(&self, level: LogLevel, message: &str, context: I) -> bool
    where
        I: IntoIterator<Item = D>,
        D: Display,
    {
        let mut full = message.to_string();
        for item in context {
            full.push(' ');
            full.push_str(&item.to_string());
        }
        self.log(level, full)
    }

    /// Snapshot of the retained entries, oldest first.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.lock().iter().cloned().collect()
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no entries are retained.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<LogEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn mirror(level: LogLevel, message: &str) {
    match level {
        LogLevel::Debug => tracing::debug!(target: "mcplink", "{message}"),
        LogLevel::Info => tracing::info!(target: "mcplink", "{message}"),
        LogLevel::Warn => tracing::warn!(target: "mcplink", "{message}"),
        LogLevel::Error => tracing::error!(target: "mcplink", "{message}"),
    }
}

/// Logging configuration.
pub struct LogConfig {
    /// Whether to print logs to stderr.
    pub print: bool,
    /// Log level.
    pub level: LogLevel,
    /// Whether to include file/line info in logs.
    pub include_location: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            print: false,
            level: LogLevel::Info,
            include_location: false,
        }
    }
}

/// Initialize logging with the given configuration.
///
/// This should be called once at application startup. `RUST_LOG` overrides
/// the configured level.
pub fn init(config: LogConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.print {
        let fmt_layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_level(true)
            .with_file(config.include_location)
            .with_line_number(config.include_location);

        subscriber.with(fmt_layer).init();
    } else {
        subscriber.init();
    }
}

/// Get the default directory for mcplink state (auth storage, logs).
pub fn default_state_dir() -> Option<PathBuf> {
    dirs::data_local_dir().map(|p| p.join("mcplink"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_from_str() {
        assert_eq!(LogLevel::parse("debug"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse("WARNING"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("invalid"), None);
    }

    #[test]
    fn test_log_level_serde() {
        let json = serde_json::to_string(&LogLevel::Warn).unwrap();
        assert_eq!(json, "\"warn\"");
    }

    #[test]
    fn test_debug_suppressed_without_flag() {
        let log = SessionLog::new(false);
        assert!(!log.log(LogLevel::Debug, "hidden"));
        assert!(log.log(LogLevel::Info, "shown"));
        assert_eq!(log.len(), 1);
        assert_eq!(log.entries()[0].message, "shown");
    }

    #[test]
    fn test_debug_kept_with_flag() {
        let log = SessionLog::new(true);
        assert!(log.log(LogLevel::Debug, "visible"));
        assert_eq!(log.entries()[0].level, LogLevel::Debug);
    }

    #[test]
    fn test_log_is_bounded_and_ordered() {
        let log = SessionLog::new(false);
        for i in 0..250 {
            log.log(LogLevel::Info, format!("entry {i}"));
        }

        let entries = log.entries();
        assert_eq!(entries.len(), MAX_LOG_ENTRIES);
        assert_eq!(entries.first().unwrap().message, "entry 150");
        assert_eq!(entries.last().unwrap().message, "entry 249");
        for pair in entries.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
    }

    #[test]
    fn test_unmounted_log_does_not_retain() {
        let log = SessionLog::new(false);
        log.set_mounted(false);
        assert!(!log.log(LogLevel::Error, "after teardown"));
        assert!(log.is_empty());
    }

    #[test]
    fn test_log_with_context() {
        let log = SessionLog::new(false);
        log.log_with(LogLevel::Warn, "Close failed:", ["broken pipe"]);
        assert_eq!(log.entries()[0].message, "Close failed: broken pipe");
    }

    #[test]
    fn test_default_log_config() {
        let config = LogConfig::default();
        assert!(!config.print);
        assert_eq!(config.level, LogLevel::Info);
    }
}
