//! Environment variable access with structured errors.
//!
//! Values that are present but blank are treated the same as missing ones, so a
//! stray `DATABASE_URL=` in a shell profile does not win over a config file.

use std::str::FromStr;

use thiserror::Error;

/// Errors raised while reading configuration from the environment.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvError {
    /// The variable is unset or blank.
    #[error("missing environment variable: {0}")]
    Missing(String),
    /// The variable is set but could not be parsed into the requested type.
    #[error("environment variable {name} has an invalid value {value:?}")]
    Invalid {
        /// Variable name.
        name: String,
        /// Raw value as found in the environment.
        value: String,
    },
}

/// Reads a required environment variable.
///
/// # Arguments
/// * `name` - The name of the environment variable to read.
pub fn get_env_var(name: &str) -> Result<String, EnvError> {
    get_env_var_opt(name).ok_or_else(|| EnvError::Missing(name.to_string()))
}

/// Reads an optional environment variable, trimming it and mapping blank to `None`.
pub fn get_env_var_opt(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Reads and parses an optional environment variable.
///
/// Returns `Ok(None)` when unset, and [`EnvError::Invalid`] when set but unparsable.
pub fn parse_env_var<T: FromStr>(name: &str) -> Result<Option<T>, EnvError> {
    match get_env_var_opt(name) {
        None => Ok(None),
        Some(raw) => raw.parse::<T>().map(Some).map_err(|_| EnvError::Invalid {
            name: name.to_string(),
            value: raw,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test uses its own variable name so they can run in parallel.

    #[test]
    fn blank_value_counts_as_missing() {
        unsafe { std::env::set_var("SHARED_UTILS_TEST_BLANK", "   ") };
        assert_eq!(
            get_env_var("SHARED_UTILS_TEST_BLANK"),
            Err(EnvError::Missing("SHARED_UTILS_TEST_BLANK".into()))
        );
    }

    #[test]
    fn value_is_trimmed() {
        unsafe { std::env::set_var("SHARED_UTILS_TEST_TRIM", "  sqlite.db ") };
        assert_eq!(get_env_var("SHARED_UTILS_TEST_TRIM").unwrap(), "sqlite.db");
    }

    #[test]
    fn parse_reports_invalid_values() {
        unsafe { std::env::set_var("SHARED_UTILS_TEST_PARSE", "three") };
        let err = parse_env_var::<u32>("SHARED_UTILS_TEST_PARSE").unwrap_err();
        assert!(matches!(err, EnvError::Invalid { .. }));

        unsafe { std::env::set_var("SHARED_UTILS_TEST_PARSE_OK", "3") };
        assert_eq!(parse_env_var::<u32>("SHARED_UTILS_TEST_PARSE_OK").unwrap(), Some(3));
        assert_eq!(parse_env_var::<u32>("SHARED_UTILS_TEST_UNSET_XYZ").unwrap(), None);
    }
}
