//! Environment variable utilities
//!
//! Every config struct in bblocks starts from compile-time defaults and
//! lets `BB_*` environment variables override them through these helpers.

use std::str::FromStr;

/// Get environment variable parsed as type T, or return default
///
/// Unset variables and parse failures both fall back to `default`.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Get environment variable as boolean
///
/// Accepts: "1", "true", "yes", "on" (case-insensitive) as true.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("__BB_TEST_UNSET_VAR__", 42);
        assert_eq!(val, 42);
        assert_eq!(env_get_str("__BB_TEST_UNSET_VAR__", "hello"), "hello");
        assert!(env_get_bool("__BB_TEST_UNSET_VAR__", true));
    }

    #[test]
    fn test_env_get_with_set_var() {
        std::env::set_var("__BB_TEST_NUM__", "123");
        let val: usize = env_get("__BB_TEST_NUM__", 0);
        assert_eq!(val, 123);

        std::env::set_var("__BB_TEST_NUM__", "not_a_number");
        let val: usize = env_get("__BB_TEST_NUM__", 99);
        assert_eq!(val, 99);
        std::env::remove_var("__BB_TEST_NUM__");
    }

    #[test]
    fn test_env_get_bool_variants() {
        for (raw, expect) in [("1", true), ("TRUE", true), ("on", true), ("0", false), ("garbage", false)] {
            std::env::set_var("__BB_TEST_BOOL__", raw);
            assert_eq!(env_get_bool("__BB_TEST_BOOL__", !expect), expect, "{}", raw);
        }
        std::env::remove_var("__BB_TEST_BOOL__");
    }
}
