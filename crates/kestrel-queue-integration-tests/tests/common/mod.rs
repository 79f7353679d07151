//! Common test utilities for kestrel-queue integration tests
//!
//! This module provides:
//! - A recording listener with scriptable failures
//! - Config and manager builders over the in-memory backend
//! - A fake memcached-protocol server backed by the in-memory backend

use async_trait::async_trait;
use kestrel_queue::{
    Connection, ConnectionFactory, InMemoryBackend, Message, MessageRegistry, ProviderType,
    QueueConfig, QueueListener, QueueManager, QueueMessage, QueueName, ServerAddress,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueMessage {
    pub value: i32,
}

impl QueueMessage for ValueMessage {
    fn identifier() -> &'static str {
        "em"
    }
}

pub fn registry() -> Arc<MessageRegistry> {
    let registry = MessageRegistry::new();
    registry.register::<ValueMessage>();
    Arc::new(registry)
}

// ============================================================================
// Recording listener
// ============================================================================

/// Records delivered values; fails the first `failures` deliveries
#[derive(Default)]
pub struct RecordingListener {
    values: Mutex<Vec<i32>>,
    calls: AtomicUsize,
    failures: AtomicUsize,
}

#[allow(dead_code)]
impl RecordingListener {
    pub fn failing(failures: usize) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
            ..Default::default()
        }
    }

    /// Values whose processing succeeded
    pub fn values(&self) -> Vec<i32> {
        self.values.lock().unwrap().clone()
    }

    /// Every call, including failed ones
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueueListener for RecordingListener {
    async fn process(&self, _queue: &QueueName, message: Box<dyn Message>) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let value = message
            .downcast_ref::<ValueMessage>()
            .map(|m| m.value)
            .ok_or_else(|| anyhow::anyhow!("unexpected message type"))?;

        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            anyhow::bail!("simulated failure processing {}", value);
        }

        self.values.lock().unwrap().push(value);
        Ok(())
    }
}

// ============================================================================
// Builders
// ============================================================================

/// Short poll window so idle cycles are quick
pub fn test_config() -> QueueConfig {
    QueueConfig {
        provider: ProviderType::InMemory,
        poll_timeout_ms: 100,
        read_grace_ms: 200,
        error_backoff_ms: 20,
        op_timeout_ms: 500,
        ..Default::default()
    }
}

pub fn in_memory_manager(backend: &InMemoryBackend) -> QueueManager {
    init_tracing();
    QueueManager::new(test_config(), Arc::new(backend.clone()), registry())
}

#[allow(dead_code)]
pub fn memcached_manager(server: &FakeKestrelServer) -> QueueManager {
    init_tracing();
    let config = QueueConfig {
        provider: ProviderType::Memcached,
        servers: server.address().to_string(),
        ..test_config()
    };
    QueueManager::memcached(config, registry()).expect("valid memcached config")
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kestrel_queue=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Poll `condition` until it holds or five seconds pass
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ============================================================================
// Fake Kestrel server
// ============================================================================

/// Speaks the memcached text protocol subset Kestrel uses (`get`, `set`,
/// `quit`) and serves it from an [`InMemoryBackend`]. Each TCP client gets
/// its own backend connection, so closing the socket returns its open items.
pub struct FakeKestrelServer {
    address: ServerAddress,
    backend: InMemoryBackend,
}

#[allow(dead_code)]
impl FakeKestrelServer {
    pub async fn start(backend: InMemoryBackend) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let accept_backend = backend.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let backend = accept_backend.clone();
                tokio::spawn(async move {
                    if let Ok(connection) = backend.connect().await {
                        let _ = serve(socket, connection).await;
                    }
                });
            }
        });

        Self {
            address: ServerAddress {
                host: "127.0.0.1".to_string(),
                port,
            },
            backend,
        }
    }

    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    pub fn backend(&self) -> &InMemoryBackend {
        &self.backend
    }
}

async fn serve(
    socket: tokio::net::TcpStream,
    mut connection: Box<dyn Connection>,
) -> std::io::Result<()> {
    let (read_half, mut writer) = socket.into_split();
    let mut reader = BufReader::new(read_half);

    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();

        let reply = match parts.as_slice() {
            ["get", key] => match connection.get(key, Duration::from_secs(60)).await {
                Ok(Some(value)) => format!("VALUE {} 0 {}\r\n{}\r\nEND\r\n", key, value.len(), value),
                Ok(None) => "END\r\n".to_string(),
                Err(e) => error_reply(&e.to_string()),
            },
            ["set", key, _flags, ttl, bytes] => {
                let length: usize = bytes.parse().unwrap_or(0);
                let mut data = vec![0u8; length + 2];
                reader.read_exact(&mut data).await?;
                data.truncate(length);
                let value = String::from_utf8_lossy(&data).to_string();
                let ttl: u32 = ttl.parse().unwrap_or(0);

                match connection.set(key, ttl, &value).await {
                    Ok(true) => "STORED\r\n".to_string(),
                    Ok(false) => "NOT_STORED\r\n".to_string(),
                    Err(e) => error_reply(&e.to_string()),
                }
            }
            ["quit"] => break,
            _ => "ERROR\r\n".to_string(),
        };

        writer.write_all(reply.as_bytes()).await?;
    }

    connection.shutdown().await.ok();
    Ok(())
}

fn error_reply(message: &str) -> String {
    let line = message.lines().next().unwrap_or_default();
    if line.contains("CLIENT_ERROR") {
        "CLIENT_ERROR bad request\r\n".to_string()
    } else {
        format!("SERVER_ERROR {}\r\n", line)
    }
}
