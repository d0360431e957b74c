// Server and client configuration.
//
// The server reads an optional TOML file with `[server]`, `[admin]` and
// `[logging]` sections. Every field has a default, so an empty file (or no
// file) yields a runnable loopback configuration. The binaries layer CLI
// flags on top and call `validate()` before starting anything.
//
// The admin password may also come from `BOARDROOM_ADMIN_PASSWORD`, so it
// does not have to sit in a file or on a command line.

use std::path::{Path, PathBuf};
use std::time::Duration;

use boardroom_protocol::{MAX_MESSAGE_SIZE, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ADMIN_PASSWORD_ENV: &str = "BOARDROOM_ADMIN_PASSWORD";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub admin: AdminConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load from a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&text)?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(password) = std::env::var(ADMIN_PASSWORD_ENV) {
            self.admin.password = Some(password);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.bind.trim().is_empty() {
            return Err(ConfigError::Invalid("server.bind cannot be empty".into()));
        }
        if self.server.max_message_size == 0 {
            return Err(ConfigError::Invalid(
                "server.max_message_size must be greater than 0".into(),
            ));
        }
        if self.server.max_message_size > i32::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "server.max_message_size cannot exceed {}",
                i32::MAX
            )));
        }
        if let Some(password) = &self.admin.password {
            if password.is_empty() {
                return Err(ConfigError::Invalid(
                    "admin.password cannot be empty (omit it to disable the admin channel)".into(),
                ));
            }
            if self.server.port != 0 && self.server.port == self.admin.port {
                return Err(ConfigError::Invalid(format!(
                    "server and admin cannot share port {}",
                    self.server.port
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind the session listener to.
    pub bind: String,
    /// Session listener port. 0 picks an ephemeral port.
    pub port: u16,
    /// Largest accepted payload in bytes.
    pub max_message_size: usize,
    /// Version a client's `Hello` must announce.
    pub protocol_version: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 7878,
            max_message_size: MAX_MESSAGE_SIZE as usize,
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub bind: String,
    pub port: u16,
    /// Shared secret for admin logins. `None` disables the admin channel.
    pub password: Option<String>,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 7879,
            password: None,
        }
    }
}

impl AdminConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive, e.g. `info` or
    /// `boardroom_relay=debug`.
    pub filter: String,
    /// Append logs here instead of stderr. The admin log commands read it.
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".into(),
            file: None,
        }
    }
}

/// Timeouts and limits for `Client` connections.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Upper bound on establishing the TCP connection.
    pub connect_timeout: Duration,
    /// Upper bound on sending the handshake and receiving its reply.
    pub response_timeout: Duration,
    pub max_message_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(1),
            response_timeout: Duration::from_secs(3),
            max_message_size: MAX_MESSAGE_SIZE as usize,
        }
    }
}
