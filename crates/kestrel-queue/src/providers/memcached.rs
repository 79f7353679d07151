//! Memcached text protocol connection for Kestrel queue servers.
//!
//! Only the three commands the queue manager needs are spoken: `get`, `set`
//! and `quit`. Kestrel treats a `set` as an enqueue and a `get` as a dequeue,
//! with read options carried in the key. There is no heartbeat and values are
//! sent as plain JSON text without compression.
//!
//! A connection keeps one stream per configured server. Servers that are
//! down when the connection is built are retried when a key first needs
//! them, so one dead server only fails the queues that hash to it.

use crate::client::{Connection, ConnectionFactory};
use crate::error::{ConfigurationError, TransportError};
use crate::provider::{QueueConfig, ServerAddress};
use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "memcached_tests.rs"]
mod tests;

/// Longest key a memcached server accepts
pub const MAX_KEY_LEN: usize = 250;

/// Builds [`MemcachedConnection`]s to a fixed server list
#[derive(Debug, Clone)]
pub struct MemcachedFactory {
    servers: Vec<ServerAddress>,
    op_timeout: Duration,
    connect_timeout: Duration,
}

impl MemcachedFactory {
    pub fn new(servers: Vec<ServerAddress>, op_timeout: Duration, connect_timeout: Duration) -> Self {
        Self {
            servers,
            op_timeout,
            connect_timeout,
        }
    }

    /// Create factory from the configured server list and timeouts
    pub fn from_config(config: &QueueConfig) -> Result<Self, ConfigurationError> {
        Ok(Self::new(
            config.server_addresses()?,
            config.op_timeout(),
            config.connect_timeout(),
        ))
    }

    pub fn servers(&self) -> &[ServerAddress] {
        &self.servers
    }
}

#[async_trait]
impl ConnectionFactory for MemcachedFactory {
    /// Fails only if no configured server can be reached
    async fn connect(&self) -> Result<Box<dyn Connection>, TransportError> {
        let mut links = Vec::with_capacity(self.servers.len());
        let mut last_error = None;

        for address in &self.servers {
            let stream = match open_stream(address, self.connect_timeout).await {
                Ok(stream) => {
                    debug!(server = %address, "Connected to queue server");
                    Some(stream)
                }
                Err(e) => {
                    warn!(server = %address, error = %e, "Queue server unavailable, will retry on use");
                    last_error = Some(e);
                    None
                }
            };
            links.push(ServerLink {
                address: address.clone(),
                stream,
            });
        }

        if links.iter().all(|link| link.stream.is_none()) {
            return Err(last_error.unwrap_or(TransportError::Shutdown));
        }

        Ok(Box::new(MemcachedConnection {
            links,
            op_timeout: self.op_timeout,
            connect_timeout: self.connect_timeout,
            shut_down: false,
        }))
    }
}

async fn open_stream(
    address: &ServerAddress,
    connect_timeout: Duration,
) -> Result<BufStream<TcpStream>, TransportError> {
    let target = (address.host.as_str(), address.port);
    let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(target)).await {
        Ok(stream) => stream?,
        Err(_) => {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("connecting to {} timed out", address),
            )))
        }
    };
    stream.set_nodelay(true)?;
    Ok(BufStream::new(stream))
}

struct ServerLink {
    address: ServerAddress,
    /// None while the server is unreachable
    stream: Option<BufStream<TcpStream>>,
}

/// One TCP stream per configured server
pub struct MemcachedConnection {
    links: Vec<ServerLink>,
    op_timeout: Duration,
    connect_timeout: Duration,
    shut_down: bool,
}

/// Pick the server for a key. All read options of one queue go to the same
/// server, so a `/close` always reaches the server that served the `/open`.
fn server_index(key: &str, server_count: usize) -> usize {
    let queue = key.split('/').next().unwrap_or(key);
    let mut hasher = DefaultHasher::new();
    queue.hash(&mut hasher);
    (hasher.finish() % server_count as u64) as usize
}

fn validate_key(key: &str) -> Result<(), TransportError> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(TransportError::Protocol {
            message: format!("CLIENT_ERROR key must be 1-{} bytes", MAX_KEY_LEN),
        });
    }
    if key.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(TransportError::Protocol {
            message: "CLIENT_ERROR key contains whitespace or control characters".to_string(),
        });
    }
    Ok(())
}

/// Map server error lines to protocol errors
fn error_line(line: &str) -> Option<TransportError> {
    if line == "ERROR" || line.starts_with("CLIENT_ERROR") || line.starts_with("SERVER_ERROR") {
        Some(TransportError::Protocol {
            message: line.to_string(),
        })
    } else {
        None
    }
}

async fn read_line(stream: &mut BufStream<TcpStream>) -> Result<String, TransportError> {
    let mut line = String::new();
    let read = stream.read_line(&mut line).await?;
    if read == 0 {
        return Err(TransportError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "server closed the connection",
        )));
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

/// Parse the reply to a single-key `get`
async fn read_get_reply(
    stream: &mut BufStream<TcpStream>,
) -> Result<Option<String>, TransportError> {
    let header = read_line(stream).await?;
    if header == "END" {
        return Ok(None);
    }
    if let Some(err) = error_line(&header) {
        return Err(err);
    }

    // VALUE <key> <flags> <bytes>
    let fields: Vec<&str> = header.split_whitespace().collect();
    let length = match fields.as_slice() {
        ["VALUE", _key, _flags, bytes, ..] => bytes.parse::<usize>().ok(),
        _ => None,
    }
    .ok_or_else(|| TransportError::Protocol {
        message: format!("unexpected reply to get: '{}'", header),
    })?;

    let mut data = vec![0u8; length + 2];
    stream.read_exact(&mut data).await?;
    data.truncate(length);

    let trailer = read_line(stream).await?;
    if trailer != "END" {
        return Err(TransportError::Protocol {
            message: format!("expected END after value, got '{}'", trailer),
        });
    }

    String::from_utf8(data)
        .map(Some)
        .map_err(|_| TransportError::Protocol {
            message: "value is not valid UTF-8".to_string(),
        })
}

async fn read_set_reply(stream: &mut BufStream<TcpStream>) -> Result<bool, TransportError> {
    let line = read_line(stream).await?;
    match line.as_str() {
        "STORED" => Ok(true),
        "NOT_STORED" => Ok(false),
        _ => Err(error_line(&line).unwrap_or_else(|| TransportError::Protocol {
            message: format!("unexpected reply to set: '{}'", line),
        })),
    }
}

impl MemcachedConnection {
    /// Stream to the server that owns `key`, reconnecting to it if it was
    /// unreachable before. A failed reconnect leaves the other servers alone.
    async fn stream_for(&mut self, key: &str) -> Result<&mut BufStream<TcpStream>, TransportError> {
        if self.shut_down || self.links.is_empty() {
            return Err(TransportError::Shutdown);
        }
        let connect_timeout = self.connect_timeout;
        let index = server_index(key, self.links.len());
        let link = &mut self.links[index];

        if link.stream.is_none() {
            let stream = open_stream(&link.address, connect_timeout).await?;
            debug!(server = %link.address, "Reconnected to queue server");
            link.stream = Some(stream);
        }
        link.stream.as_mut().ok_or(TransportError::Shutdown)
    }

    /// A timed out or broken stream has an unknown amount of unread reply on
    /// it, so the whole connection is dropped and the owner builds a new one.
    fn poison(&mut self, err: &TransportError) {
        if matches!(err, TransportError::Timeout { .. } | TransportError::Io(_)) {
            warn!(error = %err, "Dropping queue server connection");
            self.links.clear();
            self.shut_down = true;
        }
    }
}

#[async_trait]
impl Connection for MemcachedConnection {
    async fn get(&mut self, key: &str, timeout: Duration) -> Result<Option<String>, TransportError> {
        validate_key(key)?;
        let stream = self.stream_for(key).await?;

        let exchange = async {
            stream.write_all(format!("get {}\r\n", key).as_bytes()).await?;
            stream.flush().await?;
            read_get_reply(stream).await
        };

        let result = match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout { duration: timeout }),
        };

        if let Err(ref err) = result {
            self.poison(err);
        }
        result
    }

    async fn set(&mut self, key: &str, ttl_secs: u32, value: &str) -> Result<bool, TransportError> {
        validate_key(key)?;
        let op_timeout = self.op_timeout;
        let stream = self.stream_for(key).await?;

        let exchange = async {
            let command = format!("set {} 0 {} {}\r\n", key, ttl_secs, value.len());
            stream.write_all(command.as_bytes()).await?;
            stream.write_all(value.as_bytes()).await?;
            stream.write_all(b"\r\n").await?;
            stream.flush().await?;
            read_set_reply(stream).await
        };

        let result = match tokio::time::timeout(op_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout {
                duration: op_timeout,
            }),
        };

        if let Err(ref err) = result {
            self.poison(err);
        }
        result
    }

    async fn shutdown(&mut self) -> Result<(), TransportError> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;

        for link in self.links.drain(..) {
            let Some(mut stream) = link.stream else {
                continue;
            };
            let quit = async {
                stream.write_all(b"quit\r\n").await?;
                stream.flush().await?;
                stream.get_mut().shutdown().await
            };
            if let Err(e) = tokio::time::timeout(self.op_timeout, quit)
                .await
                .unwrap_or_else(|_| Err(std::io::ErrorKind::TimedOut.into()))
            {
                debug!(server = %link.address, error = %e, "Error closing queue server stream");
            }
        }
        Ok(())
    }

    fn is_shutdown(&self) -> bool {
        self.shut_down
    }
}
