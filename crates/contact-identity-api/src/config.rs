//! Store connection configuration.
//!
//! Values are layered lowest to highest: built-in defaults, an optional YAML file,
//! then `CONTACT_IDENTITY_DB_*` environment variables and explicit flags (both read
//! through [`StoreArgs`]).

use std::fmt::{Debug, Display, Formatter};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    Disable,
    Prefer,
    #[default]
    Require,
    VerifyFull,
}

impl SslMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disable => "disable",
            Self::Prefer => "prefer",
            Self::Require => "require",
            Self::VerifyFull => "verify-full",
        }
    }
}

impl FromStr for SslMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "disable" => Ok(Self::Disable),
            "prefer" => Ok(Self::Prefer),
            "require" => Ok(Self::Require),
            "verify-full" => Ok(Self::VerifyFull),
            other => Err(ConfigError::Invalid(format!("unknown sslMode: {other}"))),
        }
    }
}

impl Display for SslMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection parameters for the contact store. The `SQLite` backend opens `dbname`
/// as its database file; the remaining options describe the server endpoint.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct StoreConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub dbname: String,
    pub ssl_mode: SslMode,
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "contact_identity".to_string(),
            password: String::new(),
            dbname: "./contact_identity.sqlite3".to_string(),
            ssl_mode: SslMode::default(),
            busy_timeout_ms: 5000,
        }
    }
}

impl Debug for StoreConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &if self.password.is_empty() { "" } else { "***" })
            .field("dbname", &self.dbname)
            .field("ssl_mode", &self.ssl_mode)
            .field("busy_timeout_ms", &self.busy_timeout_ms)
            .finish()
    }
}

impl StoreConfig {
    /// Parse a YAML document. Missing keys keep their defaults.
    ///
    /// # Errors
    /// Returns [`ConfigError::Parse`] for malformed YAML or unknown keys, and
    /// [`ConfigError::Invalid`] when the result fails validation.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns [`ConfigError::Io`] when the file cannot be read, otherwise as
    /// [`StoreConfig::from_yaml_str`].
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let yaml = fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        Self::from_yaml_str(&yaml)
    }

    /// # Errors
    /// Returns [`ConfigError::Invalid`] naming the first offending option.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid("host MUST be non-empty".to_string()));
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid("port MUST be non-zero".to_string()));
        }
        if self.dbname.trim().is_empty() {
            return Err(ConfigError::Invalid("dbname MUST be non-empty".to_string()));
        }
        Ok(())
    }

    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(&self.dbname)
    }

    #[must_use]
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// Connection descriptor safe for logs: every option except the password.
    #[must_use]
    pub fn redacted_descriptor(&self) -> String {
        format!(
            "host={} port={} user={} dbname={} sslmode={}",
            self.host, self.port, self.user, self.dbname, self.ssl_mode
        )
    }
}

/// Store options shared by the service and the CLI.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct StoreArgs {
    /// YAML file with store options; flags and environment variables override it.
    #[arg(long = "config", env = "CONTACT_IDENTITY_CONFIG")]
    pub config_file: Option<PathBuf>,
    #[arg(long = "db-host", env = "CONTACT_IDENTITY_DB_HOST")]
    pub host: Option<String>,
    #[arg(long = "db-port", env = "CONTACT_IDENTITY_DB_PORT")]
    pub port: Option<u16>,
    #[arg(long = "db-user", env = "CONTACT_IDENTITY_DB_USER")]
    pub user: Option<String>,
    #[arg(long = "db-password", env = "CONTACT_IDENTITY_DB_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,
    #[arg(long = "db-name", env = "CONTACT_IDENTITY_DB_NAME")]
    pub dbname: Option<String>,
    #[arg(long = "db-sslmode", env = "CONTACT_IDENTITY_DB_SSLMODE")]
    pub ssl_mode: Option<String>,
    #[arg(long = "db-busy-timeout-ms", env = "CONTACT_IDENTITY_DB_BUSY_TIMEOUT_MS")]
    pub busy_timeout_ms: Option<u64>,
}

impl StoreArgs {
    /// Resolve the effective configuration.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] when the config file cannot be loaded, an override is
    /// malformed, or the merged configuration is invalid.
    pub fn load(&self) -> Result<StoreConfig, ConfigError> {
        let base = match &self.config_file {
            Some(path) => StoreConfig::from_yaml_file(path)?,
            None => StoreConfig::default(),
        };
        self.apply(base)
    }

    fn apply(&self, mut config: StoreConfig) -> Result<StoreConfig, ConfigError> {
        if let Some(host) = &self.host {
            config.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(user) = &self.user {
            config.user.clone_from(user);
        }
        if let Some(password) = &self.password {
            config.password.clone_from(password);
        }
        if let Some(dbname) = &self.dbname {
            config.dbname.clone_from(dbname);
        }
        if let Some(ssl_mode) = &self.ssl_mode {
            config.ssl_mode = ssl_mode.parse()?;
        }
        if let Some(busy_timeout_ms) = self.busy_timeout_ms {
            config.busy_timeout_ms = busy_timeout_ms;
        }
        config.validate()?;
        Ok(config)
    }
}
