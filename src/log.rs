//! Structured logging for weft runs.
//!
//! Log levels:
//! - ERROR: Fatal plan, batch or setup failures
//! - WARN: Recoverable conditions (test failures before retry, bulk-move misses)
//! - INFO: Batch, step and queue transitions
//! - DEBUG: Prompts, file reads, subprocess details
//! - TRACE: Raw generator output
//!
//! Debug mode can be enabled with `--debug` or `WEFT_DEBUG=1`. The CLI also
//! turns on stderr echo so INFO-and-above lines show up in the terminal.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::OnceLock;

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static ECHO: AtomicBool = AtomicBool::new(false);
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

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
    pub fn as_str(&self) -> &'static str {
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

fn env_debug() -> bool {
    std::env::var("WEFT_DEBUG")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Initialize logging to `~/.weft/weft.log`.
pub fn init_with_debug(debug: bool) {
    match dirs::home_dir() {
        Some(home) => init_in(&home.join(".weft"), debug),
        None => set_level(level_for(debug)),
    }
}

/// Initialize logging into `<dir>/weft.log`, truncating any previous log.
pub fn init_in(dir: &Path, debug: bool) {
    set_level(level_for(debug));
    let _ = std::fs::create_dir_all(dir);
    let path = dir.join("weft.log");
    let _ = std::fs::write(&path, "");
    LOG_PATH.set(path).ok();
}

fn level_for(debug: bool) -> LogLevel {
    if debug || env_debug() {
        LogLevel::Debug
    } else {
        LogLevel::Info
    }
}

pub fn is_debug() -> bool {
    get_level() >= LogLevel::Debug
}

/// Mirror log lines at INFO and above to stderr.
pub fn set_echo(enabled: bool) {
    ECHO.store(enabled, Ordering::SeqCst);
}

pub fn set_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::SeqCst);
}

pub fn get_level() -> LogLevel {
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

pub fn log_at(level: LogLevel, msg: &str) {
    if level > get_level() {
        return;
    }

    if ECHO.load(Ordering::Relaxed) && level <= LogLevel::Info {
        match level {
            LogLevel::Info => eprintln!("{}", msg),
            _ => eprintln!("[{}] {}", level.as_str(), msg),
        }
    }

    if let Some(path) = LOG_PATH.get() {
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
            let timestamp = chrono::Local::now().format("%H:%M:%S%.3f");
            let _ = writeln!(file, "[{}] [{}] {}", timestamp, level.as_str(), msg);
        }
    }
}

pub fn error(msg: &str) {
    log_at(LogLevel::Error, msg);
}

pub fn warn(msg: &str) {
    log_at(LogLevel::Warn, msg);
}

pub fn info(msg: &str) {
    log_at(LogLevel::Info, msg);
}

pub fn debug(msg: &str) {
    log_at(LogLevel::Debug, msg);
}

pub fn trace(msg: &str) {
    log_at(LogLevel::Trace, msg);
}

/// Log at INFO level.
#[macro_export]
macro_rules! wlog {
    ($($arg:tt)*) => {
        $crate::log::info(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! wlog_error {
    ($($arg:tt)*) => {
        $crate::log::error(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! wlog_warn {
    ($($arg:tt)*) => {
        $crate::log::warn(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! wlog_debug {
    ($($arg:tt)*) => {
        $crate::log::debug(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! wlog_trace {
    ($($arg:tt)*) => {
        $crate::log::trace(&format!($($arg)*))
    };
}
