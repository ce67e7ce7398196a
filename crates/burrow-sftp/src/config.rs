//! Configuration for the SFTP server

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// SFTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server bind address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Root directory every session is confined to
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,

    /// SSH host key path; an ephemeral Ed25519 key is generated when unset
    #[serde(default)]
    pub host_key_path: Option<PathBuf>,

    /// The single accepted username
    #[serde(default = "default_username")]
    pub username: String,

    /// Password for `username`
    #[serde(default)]
    pub password: Secret,

    /// Inactivity timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Maximum SFTP packet size (RFC 4254 recommends 32768 bytes minimum)
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: u32,

    /// Maximum handle records per session
    #[serde(default = "default_max_handles")]
    pub max_handles: usize,

    /// Largest chunk a single READ returns
    #[serde(default = "default_max_read_len")]
    pub max_read_len: usize,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// A string that never shows up in logs
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    /// Wrap a secret value
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The plain value, for comparison only
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// No secret configured
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("********")
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (text or json)
    pub format: LogFormat,
    /// Optional log file path (logs to stderr if not specified)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: None,
        }
    }
}

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text logging for human readability
    Text,
    /// JSON structured logging for log aggregators
    Json,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            root_dir: default_root_dir(),
            host_key_path: None,
            username: default_username(),
            password: Secret::default(),
            timeout: default_timeout(),
            max_packet_size: default_max_packet_size(),
            max_handles: default_max_handles(),
            max_read_len: default_max_read_len(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {e}")))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {e}")))
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] describing the first problem found.
    pub fn validate(&self) -> crate::Result<()> {
        if !self.root_dir.exists() {
            return Err(crate::Error::Config(format!(
                "Root directory does not exist: {}",
                self.root_dir.display()
            )));
        }

        if !self.root_dir.is_dir() {
            return Err(crate::Error::Config(format!(
                "Root path is not a directory: {}",
                self.root_dir.display()
            )));
        }

        if self.max_packet_size < 32768 {
            return Err(crate::Error::Config(
                "max_packet_size must be at least 32768 bytes (RFC 4254)".to_string(),
            ));
        }

        if self.username.is_empty() || self.password.is_empty() {
            return Err(crate::Error::Config(
                "username and password must both be set".to_string(),
            ));
        }

        if self.max_handles == 0 || self.max_read_len == 0 || self.timeout == 0 {
            return Err(crate::Error::Config(
                "max_handles, max_read_len and timeout must be non-zero".to_string(),
            ));
        }

        Ok(())
    }
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

const fn default_port() -> u16 {
    2222
}

fn default_root_dir() -> PathBuf {
    PathBuf::from("/tmp")
}

fn default_username() -> String {
    "user".to_string()
}

const fn default_timeout() -> u64 {
    300 // 5 minutes
}

const fn default_max_packet_size() -> u32 {
    32768 // RFC 4254 minimum
}

const fn default_max_handles() -> usize {
    crate::handle::DEFAULT_MAX_HANDLES
}

const fn default_max_read_len() -> usize {
    crate::dispatcher::DEFAULT_MAX_READ_LEN
}
