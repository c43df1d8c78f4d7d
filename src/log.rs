//! Leveled file logging for benchdag.
//!
//! Log levels:
//! - ERROR: a run or fetch could not complete
//! - WARN: recoverable surprises (stale staging dirs, duplicate axis values)
//! - INFO: run lifecycle, instance transitions, cache hits and rebuilds
//! - DEBUG: rendered commands, resolver matches, lock traffic
//! - TRACE: captured process output
//!
//! Debug mode can be enabled with `--debug` or `BENCHDAG_DEBUG=1`. The log
//! lives in `~/.benchdag/benchdag.log` unless `BENCHDAG_LOG` names a file.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

/// Log levels for filtering messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Error,
            1 => LogLevel::Warn,
            2 => LogLevel::Info,
            3 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn default_log_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("BENCHDAG_LOG") {
        return Some(PathBuf::from(path));
    }
    dirs::home_dir().map(|h| h.join(".benchdag").join("benchdag.log"))
}

/// Level chosen from the command line and environment.
///
/// `BENCHDAG_LOG_LEVEL` wins when it names a level; otherwise `--debug` or
/// `BENCHDAG_DEBUG` selects Debug and everything else runs at Info.
fn startup_level(debug: bool) -> LogLevel {
    if let Some(level) = std::env::var("BENCHDAG_LOG_LEVEL")
        .ok()
        .and_then(|v| v.parse::<LogLevel>().ok())
    {
        return level;
    }
    if debug || env_flag("BENCHDAG_DEBUG") {
        LogLevel::Debug
    } else {
        LogLevel::Info
    }
}

/// Initialize logging. The log file is truncated on the first call; later
/// calls only change the level.
pub fn init_with_debug(debug: bool) {
    set_level(startup_level(debug));

    if LOG_PATH.get().is_some() {
        return;
    }
    let Some(path) = default_log_path() else {
        return;
    };
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let _ = std::fs::write(&path, "");
    let _ = LOG_PATH.set(path);
}

pub fn set_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::SeqCst);
}

pub fn level() -> LogLevel {
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

pub fn enabled(level: LogLevel) -> bool {
    level <= self::level()
}

/// Path of the active log file, if logging was initialized.
pub fn log_path() -> Option<&'static PathBuf> {
    LOG_PATH.get()
}

/// Append one line at `level`. Lines are `[date time] [LEVEL] message`;
/// multi-line messages are indented so each record stays greppable.
pub fn write(level: LogLevel, msg: &str) {
    if !enabled(level) {
        return;
    }
    let Some(path) = LOG_PATH.get() else {
        return;
    };
    let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) else {
        return;
    };
    let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
    let body = msg.trim_end().replace('\n', "\n    ");
    let _ = writeln!(file, "[{}] [{:<5}] {}", timestamp, level.as_str(), body);
}

/// Log at INFO.
#[macro_export]
macro_rules! blog {
    ($($arg:tt)*) => {
        $crate::log::write($crate::log::LogLevel::Info, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! blog_error {
    ($($arg:tt)*) => {
        $crate::log::write($crate::log::LogLevel::Error, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! blog_warn {
    ($($arg:tt)*) => {
        $crate::log::write($crate::log::LogLevel::Warn, &format!($($arg)*))
    };
}

/// Log at DEBUG. The message is only formatted when debug output is on.
#[macro_export]
macro_rules! blog_debug {
    ($($arg:tt)*) => {
        if $crate::log::enabled($crate::log::LogLevel::Debug) {
            $crate::log::write($crate::log::LogLevel::Debug, &format!($($arg)*))
        }
    };
}

/// Log at TRACE. The message is only formatted when trace output is on.
#[macro_export]
macro_rules! blog_trace {
    ($($arg:tt)*) => {
        if $crate::log::enabled($crate::log::LogLevel::Trace) {
            $crate::log::write($crate::log::LogLevel::Trace, &format!($($arg)*))
        }
    };
}
