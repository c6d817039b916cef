//! Process environment access.
//!
//! Secrets and connection parameters are read once at startup through these helpers and
//! then passed down explicitly; nothing below the binary reads the environment.

use std::str::FromStr;

use thiserror::Error;

/// An environment variable required by the application is not set.
#[derive(Debug, Error)]
#[error("Missing environment variable: {0}")]
pub struct MissingEnvVarError(pub String);

/// Errors produced when reading typed values from the environment.
#[derive(Debug, Error)]
pub enum EnvError {
    /// The variable is not set (or is not valid unicode).
    #[error(transparent)]
    Missing(#[from] MissingEnvVarError),

    /// The variable is set but cannot be parsed into the requested type.
    #[error("Invalid value for environment variable {name}: {value:?}")]
    Invalid {
        /// Variable name.
        name: String,
        /// Raw value found in the environment.
        value: String,
    },
}

/// Reads an environment variable, returning a structured error if it's missing.
///
/// Empty values are treated as missing: an empty hashing key or database URL is never
/// what the operator meant.
pub fn get_env_var(name: &str) -> Result<String, MissingEnvVarError> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(MissingEnvVarError(name.to_string())),
    }
}

/// Reads and parses an environment variable, falling back to `default` when unset.
pub fn get_env_or<T: FromStr>(name: &str, default: T) -> Result<T, EnvError> {
    match get_env_var(name) {
        Ok(raw) => raw.trim().parse::<T>().map_err(|_| EnvError::Invalid {
            name: name.to_string(),
            value: raw,
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_variable_is_reported_by_name() {
        let err = get_env_var("SHARED_UTILS_TEST_DEFINITELY_UNSET").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Missing environment variable: SHARED_UTILS_TEST_DEFINITELY_UNSET"
        );
    }

    #[test]
    fn default_used_when_unset() {
        let v: u32 = get_env_or("SHARED_UTILS_TEST_ALSO_UNSET", 42).unwrap();
        assert_eq!(v, 42);
    }

    #[test]
    fn path_is_always_present() {
        // PATH is set in every sane test environment; use it to exercise the happy path.
        assert!(get_env_var("PATH").is_ok());
    }
}
