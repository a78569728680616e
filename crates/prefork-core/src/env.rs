//! Environment variable utilities
//!
//! ```ignore
//! use prefork_core::env::{env_get, env_get_bool};
//!
//! let threads: usize = env_get("PREFORK_AIO_THREADS", 4);
//! let wait: bool = env_get_bool("PREFORK_WAIT_SIGNAL", true);
//! ```

use std::str::FromStr;

/// Get an environment variable parsed as `T`, or `default` when unset or
/// unparsable.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Get an environment variable as boolean.
///
/// "1", "true", "yes", "on" (any case) are true, "0", "false", "no", "off"
/// are false; anything else, including unset, yields `default`.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

/// `Some(T)` when the variable is set and parses
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[inline]
pub fn env_is_set(key: &str) -> bool {
    std::env::var_os(key).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("__PREFORK_UNSET_VAR__", 42);
        assert_eq!(val, 42);
        assert!(env_get_opt::<usize>("__PREFORK_UNSET_VAR__").is_none());
        assert_eq!(env_get_str("__PREFORK_UNSET_VAR__", "hello"), "hello");
        assert!(!env_is_set("__PREFORK_UNSET_VAR__"));
    }

    #[test]
    fn test_env_get_with_set_var() {
        std::env::set_var("__PREFORK_TEST_NUM__", " 123 ");
        let val: usize = env_get("__PREFORK_TEST_NUM__", 0);
        assert_eq!(val, 123);
        std::env::remove_var("__PREFORK_TEST_NUM__");
    }

    #[test]
    fn test_env_get_bool_variants() {
        let key = "__PREFORK_TEST_BOOL__";
        for v in ["1", "true", "TRUE", "yes", "on"] {
            std::env::set_var(key, v);
            assert!(env_get_bool(key, false), "{} should be true", v);
        }
        for v in ["0", "false", "no", "off"] {
            std::env::set_var(key, v);
            assert!(!env_get_bool(key, true), "{} should be false", v);
        }
        std::env::set_var(key, "garbage");
        assert!(env_get_bool(key, true));
        assert!(!env_get_bool(key, false));
        std::env::remove_var(key);
    }

    #[test]
    fn test_env_get_invalid_parse() {
        std::env::set_var("__PREFORK_TEST_INVALID__", "not_a_number");
        let val: usize = env_get("__PREFORK_TEST_INVALID__", 99);
        assert_eq!(val, 99);
        std::env::remove_var("__PREFORK_TEST_INVALID__");
    }
}
