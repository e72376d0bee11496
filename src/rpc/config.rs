//! TOML configuration.
//!
//! ```toml
//! [rdmarpc.client]
//! connect_timeout_ms = 3000
//! buffer_size = 4096
//! call_timeout_ms = 500
//!
//! [rdmarpc.server]
//! backlog = 8
//! worker_threads = 4
//! buffer_size = 4096
//! ```
//!
//! Every field is optional.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::client::DEFAULT_CONNECTION_TIMEOUT;
use super::error::ConfigError;
use super::server::{DEFAULT_BACK_LOG, DEFAULT_THREAD_POOL_SIZE};

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Bound on the whole connection handshake.
    pub connect_timeout_ms: u64,

    /// Size of each context buffer, bounding both request and response.
    pub buffer_size: usize,

    /// Bound on a single call. `None` waits forever.
    pub call_timeout_ms: Option<u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: DEFAULT_CONNECTION_TIMEOUT.as_millis() as u64,
            buffer_size: 4096,
            call_timeout_ms: None,
        }
    }
}

impl ClientConfig {
    #[inline]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[inline]
    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen backlog.
    pub backlog: u32,

    /// Worker threads per connection.
    pub worker_threads: usize,

    /// Size of each request and response buffer. Clients advertising a
    /// larger buffer are rejected.
    pub buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            backlog: DEFAULT_BACK_LOG,
            worker_threads: DEFAULT_THREAD_POOL_SIZE,
            buffer_size: 4096,
        }
    }
}

/// Configuration of both ends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub client: ClientConfig,
    pub server: ServerConfig,
}

#[derive(Deserialize)]
struct ConfigFile {
    #[serde(default)]
    rdmarpc: RpcConfig,
}

impl RpcConfig {
    /// Load the configuration from a TOML file.
    pub fn load_toml<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse the configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(content)?;
        Ok(file.rdmarpc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RpcConfig::from_toml_str("").unwrap();
        assert_eq!(config, RpcConfig::default());
        assert_eq!(config.client.connect_timeout(), Duration::from_millis(3000));
        assert_eq!(config.client.call_timeout(), None);
        assert_eq!(config.server.backlog, 8);
        assert_eq!(config.server.worker_threads, 4);
    }

    #[test]
    fn test_partial() {
        let config = RpcConfig::from_toml_str(
            r#"
            [rdmarpc.client]
            call_timeout_ms = 250

            [rdmarpc.server]
            worker_threads = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.client.call_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.client.buffer_size, 4096);
        assert_eq!(config.server.worker_threads, 2);
        assert_eq!(config.server.buffer_size, 4096);
    }

    #[test]
    fn test_bad_input() {
        assert!(matches!(
            RpcConfig::from_toml_str("[rdmarpc.client]\nbuffer_size = \"big\""),
            Err(ConfigError::Toml(_))
        ));
        assert!(matches!(
            RpcConfig::load_toml("/nonexistent/rdmarpc.toml"),
            Err(ConfigError::Io(_))
        ));
    }
}
