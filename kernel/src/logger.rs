//! Kernel log
//!
//! Lines of the form `[ticks][CPU0][LEVEL] message` on the serial line.
//! Anything below the runtime level (`set_level`, seeded from
//! `KernelConfig::log_level`) is dropped before formatting.

use core::sync::atomic::{AtomicU64, AtomicU8, Ordering};

/// Global tick counter for timestamps
static TICK_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Lowest level that reaches the serial line
static MIN_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

/// Log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Fatal = 5,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO ",
            LogLevel::Warn => "WARN ",
            LogLevel::Error => "ERROR",
            LogLevel::Fatal => "FATAL",
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => LogLevel::Trace,
            1 => LogLevel::Debug,
            2 => LogLevel::Info,
            3 => LogLevel::Warn,
            4 => LogLevel::Error,
            _ => LogLevel::Fatal,
        }
    }
}

/// Set the minimum level that gets printed
pub fn set_level(level: LogLevel) {
    MIN_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn level() -> LogLevel {
    LogLevel::from_u8(MIN_LEVEL.load(Ordering::Relaxed))
}

pub fn enabled(level: LogLevel) -> bool {
    level >= self::level()
}

/// Get current tick count as timestamp
pub fn get_timestamp() -> u64 {
    TICK_COUNTER.load(Ordering::Relaxed)
}

/// Increment tick counter (called by timer interrupt)
pub fn tick() {
    TICK_COUNTER.fetch_add(1, Ordering::Relaxed);
}

/// Internal log function
#[doc(hidden)]
pub fn _log(level: LogLevel, args: core::fmt::Arguments) {
    if !enabled(level) {
        return;
    }
    let timestamp = get_timestamp();
    // Single CPU
    let cpu_id = 0u8;

    crate::serial::_print(format_args!(
        "[{:>10}][CPU{}][{}] {}\n",
        timestamp,
        cpu_id,
        level.as_str(),
        args
    ));
}

/// Log macro with level
#[macro_export]
macro_rules! log_level {
    ($level:expr, $($arg:tt)*) => {
        $crate::logger::_log($level, format_args!($($arg)*))
    };
}

/// Info log (default)
#[macro_export]
macro_rules! log {
    ($($arg:tt)*) => {
        $crate::log_level!($crate::logger::LogLevel::Info, $($arg)*)
    };
}

/// Trace log (per-page / per-packet noise)
#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => {
        $crate::log_level!($crate::logger::LogLevel::Trace, $($arg)*)
    };
}

/// Debug log
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::log_level!($crate::logger::LogLevel::Debug, $($arg)*)
    };
}

/// Warning log
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::log_level!($crate::logger::LogLevel::Warn, $($arg)*)
    };
}

/// Error log
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::log_level!($crate::logger::LogLevel::Error, $($arg)*)
    };
}
