//! Environment variable utilities
//!
//! Typed readers for the `UFIBER_*` overrides consulted by the runtime
//! configuration. Unset or unparsable variables fall back to the default.
//!
//! ```ignore
//! use ufiber_core::env::{env_get, env_get_bool, env_get_ms};
//!
//! let processors: usize = env_get("UFIBER_NUM_PROCESSORS", 4);
//! let hooked = env_get_bool("UFIBER_HOOK_ENABLED", false);
//! let wait = env_get_ms("UFIBER_MAX_EVENT_WAIT_MS", Duration::from_millis(10));
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Get environment variable parsed as type T, or return default
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Get environment variable as boolean
///
/// Accepts "1", "true", "yes", "on" as true and "0", "false", "no", "off"
/// as false (case-insensitive). Anything else returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

/// Get environment variable as optional value
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Get environment variable holding a millisecond count as a `Duration`
#[inline]
pub fn env_get_ms(key: &str, default: Duration) -> Duration {
    env_get_opt::<u64>(key)
        .map(Duration::from_millis)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("__UFIBER_TEST_UNSET_12345__", 42);
        assert_eq!(val, 42);
        let val: Option<usize> = env_get_opt("__UFIBER_TEST_UNSET_12345__");
        assert!(val.is_none());
    }

    #[test]
    fn test_env_get_with_set_var() {
        std::env::set_var("__UFIBER_TEST_NUM__", " 123 ");
        let val: usize = env_get("__UFIBER_TEST_NUM__", 0);
        assert_eq!(val, 123);
        std::env::remove_var("__UFIBER_TEST_NUM__");
    }

    #[test]
    fn test_env_get_invalid_parse() {
        std::env::set_var("__UFIBER_TEST_INVALID__", "not_a_number");
        let val: usize = env_get("__UFIBER_TEST_INVALID__", 99);
        assert_eq!(val, 99);
        std::env::remove_var("__UFIBER_TEST_INVALID__");
    }

    #[test]
    fn test_env_get_bool_variants() {
        for v in ["1", "true", "TRUE", "yes", "on"] {
            std::env::set_var("__UFIBER_TEST_BOOL__", v);
            assert!(env_get_bool("__UFIBER_TEST_BOOL__", false), "{}", v);
        }
        for v in ["0", "false", "No", "off"] {
            std::env::set_var("__UFIBER_TEST_BOOL__", v);
            assert!(!env_get_bool("__UFIBER_TEST_BOOL__", true), "{}", v);
        }
        std::env::set_var("__UFIBER_TEST_BOOL__", "garbage");
        assert!(env_get_bool("__UFIBER_TEST_BOOL__", true));
        assert!(!env_get_bool("__UFIBER_TEST_BOOL__", false));
        std::env::remove_var("__UFIBER_TEST_BOOL__");
    }

    #[test]
    fn test_env_get_ms() {
        let d = env_get_ms("__UFIBER_TEST_MS_UNSET__", Duration::from_millis(7));
        assert_eq!(d, Duration::from_millis(7));
        std::env::set_var("__UFIBER_TEST_MS__", "250");
        assert_eq!(
            env_get_ms("__UFIBER_TEST_MS__", Duration::ZERO),
            Duration::from_millis(250)
        );
        std::env::remove_var("__UFIBER_TEST_MS__");
    }
}
