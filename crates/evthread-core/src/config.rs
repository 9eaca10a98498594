//! Process-wide configuration.
//!
//! Settings are read from the environment on first use and cached in atomics;
//! the `set_*` functions override whatever the environment said.
//!
//! - `EVTHREAD_STACKSIZE`: default stack size in bytes for threads started with
//!   `stack_size == 0` (default 1 MiB).
//! - `EVTHREAD_FATAL`: `abort` (default) or `panic`. Controls how
//!   [`crate::fatal::fatal`] terminates.
//! - `EVTHREAD_LOG`: structured log threshold, one of
//!   `off|error|warn|info|debug|trace` (default `warn`).

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use crate::log::LogLevel;

/// Stack size used when neither the caller nor the environment picks one.
pub const DEFAULT_STACKSIZE: usize = 1024 * 1024;

/// What [`crate::fatal::fatal`] does after writing its diagnostic.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FatalAction {
    /// Terminate the process with `abort()`.
    #[default]
    Abort,
    /// Unwind with a panic carrying the diagnostic. Only meant for test suites
    /// that need to observe an invariant check firing.
    Panic,
}

impl FatalAction {
    /// Parse from string (case-insensitive). Unknown values yield `Abort`.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "panic" | "unwind" => Self::Panic,
            _ => Self::Abort,
        }
    }
}

// 0 = unresolved; otherwise the encoded value + 1.
static CACHED_FATAL: AtomicU8 = AtomicU8::new(0);
static CACHED_LOG: AtomicU8 = AtomicU8::new(0);
// 0 = unresolved.
static CACHED_STACKSIZE: AtomicUsize = AtomicUsize::new(0);

const FATAL_ABORT: u8 = 1;
const FATAL_PANIC: u8 = 2;

fn fatal_to_u8(action: FatalAction) -> u8 {
    match action {
        FatalAction::Abort => FATAL_ABORT,
        FatalAction::Panic => FATAL_PANIC,
    }
}

fn u8_to_fatal(v: u8) -> FatalAction {
    match v {
        FATAL_PANIC => FatalAction::Panic,
        _ => FatalAction::Abort,
    }
}

fn log_to_u8(level: LogLevel) -> u8 {
    match level {
        LogLevel::Trace => 1,
        LogLevel::Debug => 2,
        LogLevel::Info => 3,
        LogLevel::Warn => 4,
        LogLevel::Error => 5,
        LogLevel::Fatal => 6,
        LogLevel::Off => 7,
    }
}

fn u8_to_log(v: u8) -> LogLevel {
    match v {
        1 => LogLevel::Trace,
        2 => LogLevel::Debug,
        3 => LogLevel::Info,
        5 => LogLevel::Error,
        6 => LogLevel::Fatal,
        7 => LogLevel::Off,
        _ => LogLevel::Warn,
    }
}

fn parse_log_env(raw: &str) -> LogLevel {
    match raw.trim().to_ascii_lowercase().as_str() {
        "off" | "none" => LogLevel::Off,
        "error" => LogLevel::Error,
        "info" => LogLevel::Info,
        "debug" => LogLevel::Debug,
        "trace" | "all" => LogLevel::Trace,
        _ => LogLevel::Warn,
    }
}

fn parse_stacksize_env(raw: &str) -> Option<usize> {
    let raw = raw.trim();
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16).ok(),
        None => raw.parse::<usize>().ok(),
    };
    parsed.filter(|&size| size > 0)
}

/// How fatal invariant violations terminate (reads `EVTHREAD_FATAL` once).
#[must_use]
pub fn fatal_action() -> FatalAction {
    let cached = CACHED_FATAL.load(Ordering::Acquire);
    if cached != 0 {
        return u8_to_fatal(cached);
    }
    let action = std::env::var("EVTHREAD_FATAL")
        .map(|v| FatalAction::from_str_loose(&v))
        .unwrap_or_default();
    // A concurrent `set_fatal_action` wins over the environment.
    let _ = CACHED_FATAL.compare_exchange(
        0,
        fatal_to_u8(action),
        Ordering::AcqRel,
        Ordering::Acquire,
    );
    u8_to_fatal(CACHED_FATAL.load(Ordering::Acquire))
}

/// Override the fatal action for the rest of the process.
pub fn set_fatal_action(action: FatalAction) {
    CACHED_FATAL.store(fatal_to_u8(action), Ordering::Release);
}

/// Structured log threshold (reads `EVTHREAD_LOG` once).
#[must_use]
pub fn log_level() -> LogLevel {
    let cached = CACHED_LOG.load(Ordering::Acquire);
    if cached != 0 {
        return u8_to_log(cached);
    }
    let level = std::env::var("EVTHREAD_LOG")
        .map(|v| parse_log_env(&v))
        .unwrap_or(LogLevel::Warn);
    let _ = CACHED_LOG.compare_exchange(0, log_to_u8(level), Ordering::AcqRel, Ordering::Acquire);
    u8_to_log(CACHED_LOG.load(Ordering::Acquire))
}

/// Override the structured log threshold.
pub fn set_log_level(level: LogLevel) {
    CACHED_LOG.store(log_to_u8(level), Ordering::Release);
}

/// Systemwide default stack size, substituted when `start` gets a zero size.
#[must_use]
pub fn default_stack_size() -> usize {
    let cached = CACHED_STACKSIZE.load(Ordering::Acquire);
    if cached != 0 {
        return cached;
    }
    let size = std::env::var("EVTHREAD_STACKSIZE")
        .ok()
        .and_then(|v| parse_stacksize_env(&v))
        .unwrap_or(DEFAULT_STACKSIZE);
    let _ = CACHED_STACKSIZE.compare_exchange(0, size, Ordering::AcqRel, Ordering::Acquire);
    CACHED_STACKSIZE.load(Ordering::Acquire)
}

/// Override the default stack size. Zero restores [`DEFAULT_STACKSIZE`].
pub fn set_default_stack_size(size: usize) {
    let size = if size == 0 { DEFAULT_STACKSIZE } else { size };
    CACHED_STACKSIZE.store(size, Ordering::Release);
}
