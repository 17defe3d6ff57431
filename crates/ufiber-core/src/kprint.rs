//! Kernel-style print macros
//!
//! printk-like output to stderr. Leveled records look like
//!
//! ```text
//! [   12.004] WARN  [p1 f37] sleep ended early: errno 125
//! ```
//!
//! with the seconds since logging started, the level, and the processor and
//! fiber the record was emitted from (omitted off processor threads).
//!
//! # Environment Variables
//!
//! - `UFIBER_LOG_LEVEL` - `off`, `error`, `warn`, `info` (default), `debug`,
//!   `trace`, or the digits 0 to 5
//! - `UFIBER_FLUSH_EPRINT=1` - flush stderr after every record, so the tail
//!   survives an abort
//!
//! ```ignore
//! use ufiber_core::{kdebug, kinfo};
//!
//! kinfo!("processor {} started", id);
//! kdebug!("stole {} fibers", n);
//! ```

use crate::env::{env_get_bool, env_get_opt};
use std::cell::Cell;
use std::fmt;
use std::io::Write;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Once, OnceLock};
use std::time::Instant;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    const ALL: [LogLevel; 6] = [
        LogLevel::Off,
        LogLevel::Error,
        LogLevel::Warn,
        LogLevel::Info,
        LogLevel::Debug,
        LogLevel::Trace,
    ];

    /// Out-of-range values saturate to `Trace`
    pub fn from_u8(v: u8) -> Self {
        Self::ALL[usize::from(v.min(5))]
    }

    /// Fixed-width column text
    pub fn label(self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN ",
            LogLevel::Info => "INFO ",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }
}

impl FromStr for LogLevel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        if let Ok(n) = s.parse::<u8>() {
            return if n <= 5 { Ok(Self::from_u8(n)) } else { Err(()) };
        }
        Self::ALL
            .into_iter()
            .find(|l| format!("{:?}", l).eq_ignore_ascii_case(s.trim()))
            .ok_or(())
    }
}

static SETUP: Once = Once::new();
static LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static FLUSH: AtomicBool = AtomicBool::new(false);
static EPOCH: OnceLock<Instant> = OnceLock::new();

thread_local! {
    /// (processor id + 1, fiber id); zero means unset
    static CONTEXT: Cell<(usize, u64)> = const { Cell::new((0, 0)) };
}

/// Read `UFIBER_LOG_LEVEL` / `UFIBER_FLUSH_EPRINT`
///
/// Runs by itself on first use; an explicit call pins the uptime origin.
/// [`set_log_level`] and [`set_flush_enabled`] override the environment.
pub fn init() {
    SETUP.call_once(|| {
        EPOCH.get_or_init(Instant::now);
        if let Some(level) = env_get_opt::<LogLevel>("UFIBER_LOG_LEVEL") {
            LEVEL.store(level as u8, Ordering::Relaxed);
        }
        FLUSH.store(
            env_get_bool("UFIBER_FLUSH_EPRINT", FLUSH.load(Ordering::Relaxed)),
            Ordering::Relaxed,
        );
    });
}

pub fn log_level() -> LogLevel {
    init();
    LogLevel::from_u8(LEVEL.load(Ordering::Relaxed))
}

pub fn set_log_level(level: LogLevel) {
    init();
    LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn set_flush_enabled(enabled: bool) {
    init();
    FLUSH.store(enabled, Ordering::Relaxed);
}

#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level != LogLevel::Off && level <= log_level()
}

/// Tag this thread's records with a processor id (`None` clears it)
pub fn set_processor_context(id: Option<usize>) {
    CONTEXT.with(|c| {
        let (_, fiber) = c.get();
        c.set((id.map_or(0, |id| id + 1), fiber));
    });
}

/// Tag this thread's records with the running fiber (0 clears it)
#[inline]
pub fn set_fiber_context(id: u64) {
    CONTEXT.with(|c| {
        let (processor, _) = c.get();
        c.set((processor, id));
    });
}

/// `[p<processor> f<fiber>] ` for the calling thread, or nothing
struct ContextTag;

impl fmt::Display for ContextTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match CONTEXT.with(|c| c.get()) {
            (0, _) => Ok(()),
            (p, 0) => write!(f, "[p{}] ", p - 1),
            (p, fiber) => write!(f, "[p{} f{}] ", p - 1, fiber),
        }
    }
}

fn uptime() -> f64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_secs_f64()
}

/// Write one record under the stderr lock so lines never interleave
fn emit(level: Option<LogLevel>, args: fmt::Arguments<'_>, newline: bool) {
    init();
    let mut out = std::io::stderr().lock();
    if let Some(level) = level {
        let _ = write!(out, "[{:>9.3}] {} {}", uptime(), level.label(), ContextTag);
    }
    let _ = out.write_fmt(args);
    if newline {
        let _ = out.write_all(b"\n");
    }
    if FLUSH.load(Ordering::Relaxed) {
        let _ = out.flush();
    }
}

#[doc(hidden)]
pub fn __print(args: fmt::Arguments<'_>, newline: bool) {
    emit(None, args, newline);
}

#[doc(hidden)]
pub fn __log(level: LogLevel, args: fmt::Arguments<'_>) {
    if level_enabled(level) {
        emit(Some(level), args, true);
    }
}

/// Like `eprint!`, honoring `UFIBER_FLUSH_EPRINT`
#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => {
        $crate::kprint::__print(format_args!($($arg)*), false)
    };
}

/// Like `eprintln!`, honoring `UFIBER_FLUSH_EPRINT`
#[macro_export]
macro_rules! kprintln {
    () => {
        $crate::kprint::__print(format_args!(""), true)
    };
    ($($arg:tt)*) => {
        $crate::kprint::__print(format_args!($($arg)*), true)
    };
}

/// Leveled record; `kerror!` and friends expand to this
#[macro_export]
macro_rules! klog {
    ($level:ident, $($arg:tt)*) => {
        $crate::kprint::__log($crate::kprint::LogLevel::$level, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => { $crate::klog!(Error, $($arg)*) };
}

#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => { $crate::klog!(Warn, $($arg)*) };
}

#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => { $crate::klog!(Info, $($arg)*) };
}

#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => { $crate::klog!(Debug, $($arg)*) };
}

/// Per-operation detail; very noisy
#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => { $crate::klog!(Trace, $($arg)*) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_order() {
        assert!(LogLevel::Error < LogLevel::Warn);
        assert!(LogLevel::Info < LogLevel::Debug);
        assert_eq!(LogLevel::from_u8(99), LogLevel::Trace);
        assert_eq!(LogLevel::from_u8(2), LogLevel::Warn);
    }

    #[test]
    fn test_level_parse() {
        assert_eq!("debug".parse(), Ok(LogLevel::Debug));
        assert_eq!(" WARN ".parse(), Ok(LogLevel::Warn));
        assert_eq!("0".parse(), Ok(LogLevel::Off));
        assert_eq!("5".parse(), Ok(LogLevel::Trace));
        assert_eq!("9".parse::<LogLevel>(), Err(()));
        assert_eq!("loud".parse::<LogLevel>(), Err(()));
    }

    #[test]
    fn test_context_tag() {
        assert_eq!(ContextTag.to_string(), "");

        set_processor_context(Some(0));
        assert_eq!(ContextTag.to_string(), "[p0] ");
        set_fiber_context(17);
        assert_eq!(ContextTag.to_string(), "[p0 f17] ");

        // Fiber id is kept while the processor is cleared, but not shown
        set_processor_context(None);
        assert_eq!(ContextTag.to_string(), "");
        set_fiber_context(0);
    }

    #[test]
    fn test_off_disables_everything() {
        set_log_level(LogLevel::Off);
        assert!(!level_enabled(LogLevel::Error));
        assert!(!level_enabled(LogLevel::Off));
        kerror!("suppressed {}", 1);
        ktrace!("suppressed");
        kprint!("");
    }
}
