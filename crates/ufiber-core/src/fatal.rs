//! Fatal invariant violations
//!
//! A broken runtime contract (resuming a terminated fiber, dropping an
//! unawaited operation, corrupting a mutex word) is logged together with a
//! captured backtrace and then raised as a panic carrying [`InvariantViolation`].
//!
//! The fiber trampoline recognizes this payload and aborts the process instead
//! of retiring the fiber as failed. Outside a fiber it stays an ordinary panic,
//! which keeps the violations observable from tests.

use std::backtrace::Backtrace;
use std::fmt;

/// Panic payload raised by [`fatal!`]
#[derive(Debug, Clone)]
pub struct InvariantViolation {
    pub message: String,
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invariant violated: {}", self.message)
    }
}

#[doc(hidden)]
#[cold]
#[inline(never)]
pub fn _fatal_impl(args: fmt::Arguments<'_>) -> ! {
    let message = args.to_string();
    let backtrace = Backtrace::force_capture();
    crate::kerror!("invariant violated: {}\n{}", message, backtrace);
    std::panic::panic_any(InvariantViolation { message })
}

/// Extract a printable message from a panic payload
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(v) = payload.downcast_ref::<InvariantViolation>() {
        v.to_string()
    } else if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Report a violated runtime invariant (never returns)
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::fatal::_fatal_impl(format_args!($($arg)*))
    };
}

/// Like `assert!`, but routed through [`fatal!`]
#[macro_export]
macro_rules! fatal_assert {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::fatal!($($arg)+);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kprint::{set_log_level, LogLevel};
    use std::panic;

    #[test]
    fn test_fatal_payload() {
        set_log_level(LogLevel::Off);
        let err = panic::catch_unwind(|| {
            fatal!("state {} is not resumable", "TERM");
        })
        .unwrap_err();
        let v = err.downcast_ref::<InvariantViolation>().unwrap();
        assert_eq!(v.message, "state TERM is not resumable");
        assert_eq!(panic_message(&*err), "invariant violated: state TERM is not resumable");
    }

    #[test]
    fn test_fatal_assert_passes() {
        fatal_assert!(1 + 1 == 2, "math");
    }

    #[test]
    fn test_panic_message_variants() {
        let p = panic::catch_unwind(|| panic!("plain")).unwrap_err();
        assert_eq!(panic_message(&*p), "plain");
        let p = panic::catch_unwind(|| panic!("fmt {}", 1)).unwrap_err();
        assert_eq!(panic_message(&*p), "fmt 1");
        let p = panic::catch_unwind(|| panic::panic_any(5u8)).unwrap_err();
        assert_eq!(panic_message(&*p), "unknown panic payload");
    }
}
