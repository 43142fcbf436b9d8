//! Environment variable parsing for the configuration snapshot.
//!
//! Unset variables fall back to defaults; present-but-malformed values
//! are errors, never silent fallbacks.

use std::env;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnvError {
    #[error("missing required env var {0}")]
    Missing(&'static str),

    #[error("env var {key} holds unparseable value {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Reads and parses `key`; `Ok(None)` when unset.
pub fn var<T: FromStr>(key: &'static str) -> Result<Option<T>, EnvError> {
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| EnvError::Invalid { key, value: raw }),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(env::VarError::NotUnicode(raw)) => Err(EnvError::Invalid {
            key,
            value: raw.to_string_lossy().into_owned(),
        }),
    }
}

pub fn var_or<T: FromStr>(key: &'static str, default: T) -> Result<T, EnvError> {
    Ok(var(key)?.unwrap_or(default))
}

pub fn var_required<T: FromStr>(key: &'static str) -> Result<T, EnvError> {
    var(key)?.ok_or(EnvError::Missing(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    // each test owns a distinct variable name; tests run in parallel

    #[test]
    fn unset_var_is_none() {
        assert_eq!(var::<u64>("DUTY_WATCH_TEST_UNSET").unwrap(), None);
    }

    #[test]
    fn present_var_parses_to_the_target_type() {
        std::env::set_var("DUTY_WATCH_TEST_PARSE", "42");
        assert_eq!(var_required::<u64>("DUTY_WATCH_TEST_PARSE").unwrap(), 42);
    }

    #[test]
    fn malformed_value_is_an_error_not_a_fallback() {
        std::env::set_var("DUTY_WATCH_TEST_BAD", "not-a-number");
        assert!(matches!(
            var_or::<u64>("DUTY_WATCH_TEST_BAD", 7),
            Err(EnvError::Invalid { key: "DUTY_WATCH_TEST_BAD", .. })
        ));
    }

    #[test]
    fn default_applies_only_when_unset() {
        assert_eq!(var_or("DUTY_WATCH_TEST_DEFAULT", 7u64).unwrap(), 7);
    }

    #[test]
    fn missing_required_var_is_an_error() {
        assert!(matches!(
            var_required::<u64>("DUTY_WATCH_TEST_MISSING"),
            Err(EnvError::Missing("DUTY_WATCH_TEST_MISSING"))
        ));
    }
}
