//! Connection traits and the per-context connection provider.
//!
//! A [`Connection`] is the whole of what the queue manager needs from the
//! backend: a blocking `get` with a deadline, a `set` with a TTL and a way to
//! shut the connection down. Read options (`/t=`, `/open`, `/close`) travel
//! inside the key and are interpreted by the server.

use crate::error::TransportError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;

/// A single live connection to the backend store.
///
/// Connections are owned by exactly one context (one listener worker, or the
/// manager's `put` path) and are never shared between workers.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Fetch the value under `key`, waiting at most `timeout` for an answer.
    /// `Ok(None)` means the server had nothing to hand out.
    async fn get(&mut self, key: &str, timeout: Duration) -> Result<Option<String>, TransportError>;

    /// Store `value` under `key` for `ttl_secs` seconds. `Ok(false)` means the
    /// server answered but did not store the value.
    async fn set(&mut self, key: &str, ttl_secs: u32, value: &str) -> Result<bool, TransportError>;

    /// Close the connection. Further calls fail with [`TransportError::Shutdown`].
    async fn shutdown(&mut self) -> Result<(), TransportError>;

    fn is_shutdown(&self) -> bool;
}

/// Builds new connections to the backend
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Connection>, TransportError>;
}

/// Caches one connection for the calling context, rebuilding it when the held
/// connection has been shut down.
pub struct ConnectionProvider {
    factory: Arc<dyn ConnectionFactory>,
    connection: Option<Box<dyn Connection>>,
}

impl ConnectionProvider {
    pub fn new(factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            factory,
            connection: None,
        }
    }

    /// Get the live connection, creating one if none is held.
    ///
    /// A construction failure is returned to the caller, which decides whether
    /// and when to retry.
    pub async fn connection(&mut self) -> Result<&mut dyn Connection, TransportError> {
        let stale = self
            .connection
            .as_ref()
            .map_or(true, |connection| connection.is_shutdown());

        if stale {
            self.connection = None;
            debug!("Building new backend connection");
            self.connection = Some(self.factory.connect().await?);
        }

        match self.connection.as_deref_mut() {
            Some(connection) => Ok(connection),
            None => Err(TransportError::Shutdown),
        }
    }

    /// Whether a live connection is currently held
    pub fn is_connected(&self) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|connection| !connection.is_shutdown())
    }

    /// Shut down and drop the held connection, if any
    pub async fn release(&mut self) {
        let Some(mut connection) = self.connection.take() else {
            return;
        };

        if connection.is_shutdown() {
            return;
        }

        info!("Shutting down backend connection");
        if let Err(e) = connection.shutdown().await {
            warn!(error = %e, "Error while shutting down backend connection");
        }
    }
}

impl std::fmt::Debug for ConnectionProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionProvider")
            .field("connected", &self.is_connected())
            .finish()
    }
}
