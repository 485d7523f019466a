//! Leveled logging sink with rotation support
//!
//! Thread-safe leveled output to stderr or an append-mode file. The sink
//! understands the three administrative operations the control plane can
//! ask of it: `reopen` (log rotation), `level_up`, `level_down`. All three
//! are idempotent.
//!
//! Each line carries a process tag (`master`, `worker-3`) set once per
//! process after fork.
//!
//! # Usage
//!
//! ```ignore
//! use kestrel_core::{log_error, log_info, log_warn};
//!
//! kestrel_core::log::set_tag("worker-0");
//! log_info!("listener bound on {}", addr);
//! log_warn!("terminate command received");
//! ```

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;

/// Log levels, lowest to highest verbosity
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl Level {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Level::Off,
            1 => Level::Error,
            2 => Level::Warn,
            3 => Level::Info,
            4 => Level::Debug,
            _ => Level::Trace,
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            Level::Off => "",
            Level::Error => "[ERROR]",
            Level::Warn => "[WARN] ",
            Level::Info => "[INFO] ",
            Level::Debug => "[DEBUG]",
            Level::Trace => "[TRACE]",
        }
    }
}

static LOG_LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);

struct Sink {
    /// None means stderr
    file: Option<File>,
    path: Option<PathBuf>,
    tag: String,
}

static SINK: Mutex<Option<Sink>> = Mutex::new(None);

fn with_sink<R>(f: impl FnOnce(&mut Sink) -> R) -> R {
    let mut guard = SINK.lock().unwrap_or_else(|e| e.into_inner());
    let sink = guard.get_or_insert_with(|| Sink {
        file: None,
        path: None,
        tag: String::new(),
    });
    f(sink)
}

/// Direct output to an append-mode file; falls back to stderr on failure.
pub fn open(path: impl Into<PathBuf>) -> std::io::Result<()> {
    let path = path.into();
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    with_sink(|s| {
        s.file = Some(file);
        s.path = Some(path);
    });
    Ok(())
}

/// Re-open the current log file (after rotation moved it aside).
///
/// No-op when logging to stderr. Repeated calls have the same effect
/// as one.
pub fn reopen() {
    let path = with_sink(|s| s.path.clone());
    let Some(path) = path else { return };
    match OpenOptions::new().create(true).append(true).open(&path) {
        Ok(file) => with_sink(|s| s.file = Some(file)),
        Err(e) => {
            eprintln!("log reopen of {} failed: {}", path.display(), e);
        }
    }
}

/// Set the per-process tag included in every line.
pub fn set_tag(tag: &str) {
    with_sink(|s| s.tag = tag.to_string());
}

/// Get current log level
#[inline]
pub fn level() -> Level {
    Level::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Set log level programmatically
pub fn set_level(level: Level) {
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Raise verbosity one level, saturating at `Trace`
pub fn level_up() {
    let cur = level();
    if cur < Level::Trace {
        set_level(Level::from_u8(cur as u8 + 1));
    }
}

/// Lower verbosity one level, saturating at `Off`
pub fn level_down() {
    let cur = level();
    if cur > Level::Off {
        set_level(Level::from_u8(cur as u8 - 1));
    }
}

/// Check if a log level is enabled
#[inline]
pub fn level_enabled(l: Level) -> bool {
    l as u8 <= level() as u8
}

/// Internal: leveled write with prefix and tag
#[doc(hidden)]
pub fn _log_impl(l: Level, args: std::fmt::Arguments<'_>) {
    if !level_enabled(l) {
        return;
    }
    with_sink(|s| {
        let mut line = String::with_capacity(96);
        line.push_str(l.prefix());
        line.push(' ');
        if !s.tag.is_empty() {
            line.push('[');
            line.push_str(&s.tag);
            line.push_str("] ");
        }
        use std::fmt::Write as _;
        let _ = line.write_fmt(args);
        line.push('\n');
        match &mut s.file {
            Some(f) => {
                let _ = f.write_all(line.as_bytes());
            }
            None => {
                let _ = std::io::stderr().lock().write_all(line.as_bytes());
            }
        }
    });
}

/// Error level log
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {{
        $crate::log::_log_impl($crate::log::Level::Error, format_args!($($arg)*));
    }};
}

/// Warning level log
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {{
        $crate::log::_log_impl($crate::log::Level::Warn, format_args!($($arg)*));
    }};
}

/// Info level log
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {{
        $crate::log::_log_impl($crate::log::Level::Info, format_args!($($arg)*));
    }};
}

/// Debug level log
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {{
        $crate::log::_log_impl($crate::log::Level::Debug, format_args!($($arg)*));
    }};
}

/// Trace level log
#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => {{
        $crate::log::_log_impl($crate::log::Level::Trace, format_args!($($arg)*));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(Level::Error < Level::Warn);
        assert!(Level::Warn < Level::Info);
        assert!(Level::Info < Level::Debug);
        assert!(Level::Debug < Level::Trace);
    }

    // level state is process-global, so exercise it from a single test
    #[test]
    fn test_level_controls() {
        set_level(Level::Trace);
        level_up();
        assert_eq!(level(), Level::Trace);

        set_level(Level::Off);
        level_down();
        assert_eq!(level(), Level::Off);

        // suppressed output still goes through the macro path
        log_error!("error {}", 1);
        log_warn!("warn");
        log_info!("info");
        log_debug!("debug");
        log_trace!("trace");

        set_level(Level::Info);
        level_up();
        assert_eq!(level(), Level::Debug);
        level_down();
        level_down();
        assert_eq!(level(), Level::Warn);

        set_level(Level::Info);
    }

    #[test]
    fn test_reopen_without_file_is_noop() {
        // stderr sink: reopen must not panic or change state
        reopen();
        reopen();
    }
}
