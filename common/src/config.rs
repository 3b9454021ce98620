//! Environment variable parsing helpers
//!
//! Provides ergonomic helpers for reading configuration from environment variables.

use anyhow::{anyhow, Result};
use std::env;
use std::str::FromStr;

/// Extension trait for parsing environment variables.
///
/// Provides convenient methods for reading env vars with defaults, optional
/// values, and type parsing.
pub trait ConfigExt {
    /// Get an environment variable with a default value.
    ///
    /// # Example
    /// ```ignore
    /// let host = String::env_or("PGHOST", "localhost");
    /// ```
    fn env_or(name: &str, default: &str) -> String {
        env::var(name).unwrap_or_else(|_| default.to_string())
    }

    /// Get an environment variable if it is set and not empty.
    fn env_opt(name: &str) -> Option<String> {
        env::var(name).ok().filter(|v| !v.is_empty())
    }

    /// Get an environment variable parsed as a specific type.
    ///
    /// Returns `default` if the variable is unset or empty, and an error if it
    /// is set but does not parse.
    ///
    /// # Example
    /// ```ignore
    /// let port: u16 = u16::env_parse("PGPORT", 5432)?;
    /// ```
    fn env_parse<T: FromStr>(name: &str, default: T) -> Result<T> {
        match env::var(name) {
            Ok(v) if !v.trim().is_empty() => v
                .trim()
                .parse()
                .map_err(|_| anyhow!("{} has an invalid value: {:?}", name, v)),
            _ => Ok(default),
        }
    }
}

// Blanket implementation for all types
impl<T> ConfigExt for T {}
