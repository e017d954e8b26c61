//! Server configuration.
//!
//! [`ServerConfig`] can be built in code or deserialized from TOML:
//!
//! ```
//! use rawserve::config::ServerConfig;
//!
//! let config = ServerConfig::from_toml_str(r#"
//!     path_prefix = "/api"
//!     idle_timeout_ms = 15000
//! "#).unwrap();
//! assert_eq!(config.path_prefix, "/api");
//! assert_eq!(config.max_request_size, 8 * 1024 * 1024);
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Errors produced while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid path prefix {0:?}: must be empty or start with '/'")]
    InvalidPrefix(String),
}

/// Settings for the HTTP session layer.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Prefix prepended to every route registered on the server.
    pub path_prefix: String,

    /// Largest request (head + body) buffered before answering 413.
    pub max_request_size: usize,

    /// Initial read buffer capacity per connection.
    pub initial_buffer_size: usize,

    /// Read timeout while waiting for a request on an HTTP connection.
    /// Upgraded connections are not subject to it.
    pub idle_timeout_ms: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            path_prefix: String::new(),
            max_request_size: 8 * 1024 * 1024,
            initial_buffer_size: 4096,
            idle_timeout_ms: None,
        }
    }
}

impl ServerConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] for malformed TOML, [`ConfigError::InvalidPrefix`]
    /// for a prefix that does not start with `/`.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Io`] if the file cannot be read, otherwise as
    /// [`from_toml_str`](Self::from_toml_str).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    #[must_use]
    pub fn path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.path_prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn idle_timeout_duration(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }

    /// Checks invariants and strips a trailing `/` from the prefix.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidPrefix`] when the prefix is non-empty and does not
    /// start with `/`.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if !self.path_prefix.is_empty() && !self.path_prefix.starts_with('/') {
            return Err(ConfigError::InvalidPrefix(self.path_prefix.clone()));
        }
        while self.path_prefix.ends_with('/') {
            self.path_prefix.pop();
        }
        Ok(())
    }
}
