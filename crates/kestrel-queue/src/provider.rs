//! Provider types and configuration.

use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Environment variable prefix for configuration overrides, e.g.
/// `KESTREL_QUEUE__SERVERS="kestrel-1:22133 kestrel-2:22133"`.
pub const ENV_PREFIX: &str = "KESTREL_QUEUE";

/// Enumeration of supported queue backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    /// Kestrel (or any memcached-protocol queue server) over TCP
    #[default]
    Memcached,
    /// Process-local backend with the same read semantics
    InMemory,
}

/// A single `host:port` backend address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for ServerAddress {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigurationError::Invalid {
            message: format!("server address '{}' must be in the form host:port", s),
        };

        let (host, port) = s.rsplit_once(':').ok_or_else(invalid)?;
        if host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

/// Parse a whitespace separated server list: `"host:port host2:port"`
pub fn parse_server_list(servers: &str) -> Result<Vec<ServerAddress>, ConfigurationError> {
    let addresses = servers
        .split_whitespace()
        .map(ServerAddress::from_str)
        .collect::<Result<Vec<_>, _>>()?;

    if addresses.is_empty() {
        return Err(ConfigurationError::Missing {
            key: "servers".to_string(),
        });
    }
    Ok(addresses)
}

/// Configuration for the queue manager, its connections and listeners
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub provider: ProviderType,
    /// Space separated `host:port` list
    pub servers: String,
    /// How long the server holds a read open waiting for a message
    pub poll_timeout_ms: u64,
    /// Added to the poll window for the client side read deadline
    pub read_grace_ms: u64,
    /// Pause between failed attempts to build a connection
    pub failed_connect_delay_secs: u64,
    /// Pause after a backend or unexpected error while listening
    pub error_backoff_ms: u64,
    /// Deadline for non-blocking commands such as `set`
    pub op_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// TTL applied by `put` when none is given
    pub default_ttl_secs: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            provider: ProviderType::Memcached,
            servers: "localhost:22133".to_string(),
            poll_timeout_ms: 30_000,
            read_grace_ms: 500,
            failed_connect_delay_secs: 30,
            error_backoff_ms: 1_000,
            op_timeout_ms: 5_000,
            connect_timeout_ms: 5_000,
            default_ttl_secs: 60 * 60 * 24,
        }
    }
}

impl QueueConfig {
    /// Load configuration from an optional file, then `KESTREL_QUEUE__*`
    /// environment variables. Missing keys keep their defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigurationError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading queue configuration from file");
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let queue_config: QueueConfig = config.try_deserialize()?;
        queue_config.validate()?;
        Ok(queue_config)
    }

    /// Check the configuration for values that cannot work
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.provider == ProviderType::Memcached {
            parse_server_list(&self.servers)?;
        }

        if self.poll_timeout_ms == 0 {
            return Err(ConfigurationError::Invalid {
                message: "poll_timeout_ms must be greater than zero".to_string(),
            });
        }

        if self.error_backoff_ms == 0 {
            return Err(ConfigurationError::Invalid {
                message: "error_backoff_ms must be greater than zero".to_string(),
            });
        }

        if self.op_timeout_ms == 0 || self.connect_timeout_ms == 0 {
            return Err(ConfigurationError::Invalid {
                message: "op_timeout_ms and connect_timeout_ms must be greater than zero"
                    .to_string(),
            });
        }

        Ok(())
    }

    /// Parsed backend addresses
    pub fn server_addresses(&self) -> Result<Vec<ServerAddress>, ConfigurationError> {
        parse_server_list(&self.servers)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    /// Client side deadline for one blocking read
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms.saturating_add(self.read_grace_ms))
    }

    pub fn failed_connect_delay(&self) -> Duration {
        Duration::from_secs(self.failed_connect_delay_secs)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[cfg(test)]
#[path = "provider_tests.rs"]
mod tests;
