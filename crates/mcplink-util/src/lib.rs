//! Shared utilities for mcplink.
//!
//! - Logging setup with tracing and the bounded per-connection session log
//! - Cancellable timer slots for retry, reconnect and timeout bookkeeping

pub mod log;
pub mod timer;

pub use log::{LogConfig, LogEntry, LogLevel, SessionLog, MAX_LOG_ENTRIES};
pub use timer::TimerSlot;
