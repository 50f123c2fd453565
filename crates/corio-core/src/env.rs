//! Environment variable utilities
//!
//! Generic `env_get<T>` for parsing environment variables with defaults.
//!
//! ```ignore
//! use corio_core::env::{env_get, env_get_bool};
//!
//! let timeout: i32 = env_get("CORIO_WAIT_TIMEOUT_MS", 10_000);
//! let flush = env_get_bool("CORIO_FLUSH_EPRINT", false);
//! ```

use std::str::FromStr;

/// Get environment variable parsed as type T, or return default
///
/// Works with any type that implements `FromStr`.
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
/// Everything else (including unset) returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let v: usize = env_get("CORIO_TEST_UNSET_VAR_XYZ", 42);
        assert_eq!(v, 42);
    }

    #[test]
    fn test_env_get_parse() {
        std::env::set_var("CORIO_TEST_PARSE_VAR", "17");
        let v: i64 = env_get("CORIO_TEST_PARSE_VAR", 0);
        assert_eq!(v, 17);
        std::env::remove_var("CORIO_TEST_PARSE_VAR");
    }

    #[test]
    fn test_env_get_bool() {
        std::env::set_var("CORIO_TEST_BOOL_VAR", "yes");
        assert!(env_get_bool("CORIO_TEST_BOOL_VAR", false));
        std::env::set_var("CORIO_TEST_BOOL_VAR", "0");
        assert!(!env_get_bool("CORIO_TEST_BOOL_VAR", true));
        std::env::remove_var("CORIO_TEST_BOOL_VAR");
    }
}
