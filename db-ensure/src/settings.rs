//! Connection settings
//!
//! Settings come from the environment, optionally layered over a YAML file
//! named by `ENSURE_DB_CONFIG`. Precedence is environment, then file, then
//! the built-in defaults.

use anyhow::{Context, Result};
use common::ConfigExt;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Environment variable naming an optional YAML settings file
pub const CONFIG_PATH_VAR: &str = "ENSURE_DB_CONFIG";

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 5432;
pub const DEFAULT_USER: &str = "postgres";
pub const DEFAULT_ADMIN_DATABASE: &str = "postgres";
pub const DEFAULT_DATABASE: &str = "blog_platform";
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// PostgreSQL truncates identifiers longer than this (NAMEDATALEN - 1).
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Settings file layout. Every field is optional.
#[derive(Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    host: Option<String>,
    port: Option<u16>,
    user: Option<String>,
    password: Option<String>,
    admin_database: Option<String>,
    database: Option<String>,
    connect_timeout_secs: Option<u64>,
}

/// Why a set of connection settings was rejected
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("{field} must not be empty")]
    Empty { field: &'static str },

    #[error("{field} is {len} bytes long, PostgreSQL allows at most {max}", max = MAX_IDENTIFIER_LEN)]
    TooLong { field: &'static str, len: usize },

    #[error("{field} must not contain NUL bytes")]
    NulByte { field: &'static str },
}

/// Everything needed to reach the server and name the database to ensure
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    /// Always-present database used to bootstrap the first connection
    pub admin_database: String,
    /// Database to ensure and verify
    pub database: String,
    pub connect_timeout: Option<Duration>,
    pub application_name: String,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            user: DEFAULT_USER.to_string(),
            password: None,
            admin_database: DEFAULT_ADMIN_DATABASE.to_string(),
            database: DEFAULT_DATABASE.to_string(),
            connect_timeout: timeout_from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            application_name: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

// Hand-written so the password never ends up in logs
impl fmt::Debug for ConnectionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("admin_database", &self.admin_database)
            .field("database", &self.database)
            .field("connect_timeout", &self.connect_timeout)
            .field("application_name", &self.application_name)
            .finish()
    }
}

impl ConnectionSettings {
    /// Load settings from the optional config file and environment variables
    pub fn from_env() -> Result<Self> {
        let mut settings = match String::env_opt(CONFIG_PATH_VAR) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        settings.apply_env()?;
        Ok(settings)
    }

    /// Load settings from a YAML file, filling gaps with defaults
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path))?;

        Self::from_yaml(&content).with_context(|| format!("Failed to parse config file {}", path))
    }

    /// Parse settings from YAML text, filling gaps with defaults
    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        let file: FileConfig = serde_yaml::from_str(content).context("Invalid settings YAML")?;
        Ok(Self::default().merge(file))
    }

    fn merge(mut self, file: FileConfig) -> Self {
        if let Some(host) = file.host {
            self.host = host;
        }
        if let Some(port) = file.port {
            self.port = port;
        }
        if let Some(user) = file.user {
            self.user = user;
        }
        if file.password.is_some() {
            self.password = file.password;
        }
        if let Some(admin_database) = file.admin_database {
            self.admin_database = admin_database;
        }
        if let Some(database) = file.database {
            self.database = database;
        }
        if let Some(secs) = file.connect_timeout_secs {
            self.connect_timeout = timeout_from_secs(secs);
        }
        self
    }

    fn apply_env(&mut self) -> Result<()> {
        self.host = String::env_or("PGHOST", &self.host);
        self.port = u16::env_parse("PGPORT", self.port)?;
        self.user = String::env_or("PGUSER", &self.user);
        if let Some(password) = String::env_opt("PGPASSWORD") {
            self.password = Some(password);
        }
        self.admin_database = String::env_or("ENSURE_DB_ADMIN_DATABASE", &self.admin_database);
        self.database = String::env_or("ENSURE_DB_NAME", &self.database);

        let current_secs = self.connect_timeout.map(|t| t.as_secs()).unwrap_or(0);
        self.connect_timeout =
            timeout_from_secs(u64::env_parse("ENSURE_DB_CONNECT_TIMEOUT_SECS", current_secs)?);
        Ok(())
    }

    /// Reject settings that cannot possibly produce a working connection
    pub fn validate(&self) -> Result<(), SettingsError> {
        non_empty("host", &self.host)?;
        non_empty("user", &self.user)?;
        identifier("admin_database", &self.admin_database)?;
        identifier("database", &self.database)?;
        Ok(())
    }
}

fn timeout_from_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

fn non_empty(field: &'static str, value: &str) -> Result<(), SettingsError> {
    if value.trim().is_empty() {
        return Err(SettingsError::Empty { field });
    }
    Ok(())
}

fn identifier(field: &'static str, value: &str) -> Result<(), SettingsError> {
    non_empty(field, value)?;
    if value.contains('\0') {
        return Err(SettingsError::NulByte { field });
    }
    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(SettingsError::TooLong {
            field,
            len: value.len(),
        });
    }
    Ok(())
}
