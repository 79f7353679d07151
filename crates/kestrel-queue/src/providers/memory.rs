//! In-memory queue backend with Kestrel read semantics.
//!
//! This module provides a process-local backend that understands the same
//! key options as a Kestrel server:
//! - `<queue>/t=<ms>` blocks the read for up to `ms` milliseconds
//! - `/open` hands out the head item but keeps it until it is closed
//! - `/close` removes the item the connection has open
//! - `/abort` returns the open item to the head of the queue
//! - `/peek` returns the head item without removing it
//!
//! A connection holds at most one open item per queue. Opening again before
//! closing or aborting is a client error. An open item comes back to the
//! head of the queue when its connection shuts down, is dropped, or holds it
//! longer than the open grace window.
//!
//! The backend is intended for:
//! - Unit and integration testing of listeners without a network service
//! - Local development (`kestrel-queue demo --in-memory`)

use crate::client::{Connection, ConnectionFactory};
use crate::error::TransportError;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

/// Default time an opened item stays invisible before it is handed out again
pub const DEFAULT_OPEN_GRACE: Duration = Duration::from_secs(30);

/// Number of recent `get` keys kept for [`InMemoryBackend::requests`]
pub const REQUEST_LOG_LIMIT: usize = 1024;

// ============================================================================
// Internal Storage Structures
// ============================================================================

/// An item stored in a queue
#[derive(Clone)]
struct StoredItem {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredItem {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// An item handed out by an `/open` read and not yet closed
struct OpenItem {
    item: StoredItem,
    opened_at: Instant,
}

/// Internal state for a single queue
#[derive(Default)]
struct InMemoryQueue {
    items: VecDeque<StoredItem>,
    /// Opened item per connection id
    open: HashMap<String, OpenItem>,
}

impl InMemoryQueue {
    /// Return open items older than `grace` and drop expired items
    fn expire(&mut self, now: Instant, grace: Duration) {
        let stale_ids: Vec<String> = self
            .open
            .iter()
            .filter(|(_, open)| now.duration_since(open.opened_at) >= grace)
            .map(|(id, _)| id.clone())
            .collect();

        let mut stale: Vec<OpenItem> = stale_ids
            .iter()
            .filter_map(|id| {
                debug!(connection = %id, "Open item exceeded grace window, returning to queue");
                self.open.remove(id)
            })
            .collect();

        // Oldest open ends up at the head
        stale.sort_by_key(|open| open.opened_at);
        for open in stale.into_iter().rev() {
            self.items.push_front(open.item);
        }
        self.items.retain(|item| !item.is_expired(now));
    }

    fn open_count(&self) -> usize {
        self.open.len()
    }

    fn close(&mut self, connection_id: &str) -> Option<OpenItem> {
        self.open.remove(connection_id)
    }

    /// Put the connection's open item back at the head
    fn abort(&mut self, connection_id: &str) -> bool {
        match self.close(connection_id) {
            Some(open) => {
                self.items.push_front(open.item);
                true
            }
            None => false,
        }
    }
}

/// Failures queued up by tests
#[derive(Default)]
struct FaultPlan {
    read_timeouts: usize,
    protocol_errors: usize,
    connect_failures: usize,
}

struct BackendState {
    queues: Mutex<HashMap<String, InMemoryQueue>>,
    faults: Mutex<FaultPlan>,
    requests: Mutex<VecDeque<String>>,
    arrivals: Notify,
    open_grace: Duration,
    connections_created: AtomicUsize,
    live_connections: AtomicUsize,
}

impl BackendState {
    fn queues(&self) -> MutexGuard<'_, HashMap<String, InMemoryQueue>> {
        self.queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn faults(&self) -> MutexGuard<'_, FaultPlan> {
        self.faults
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Return the connection's open items to the head of their queues
    fn release_connection(&self, connection_id: &str) {
        let mut returned = false;
        for (name, queue) in self.queues().iter_mut() {
            if queue.abort(connection_id) {
                debug!(queue = %name, connection = %connection_id, "Returning open item of closed connection");
                returned = true;
            }
        }
        if returned {
            self.arrivals.notify_waiters();
        }
        self.live_connections.fetch_sub(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Read key parsing
// ============================================================================

/// A `get` key split into queue name and read options
#[derive(Debug, Default, PartialEq, Eq)]
struct ReadRequest {
    queue: String,
    wait: Option<Duration>,
    open: bool,
    close: bool,
    abort: bool,
    peek: bool,
}

impl ReadRequest {
    fn parse(key: &str) -> Result<Self, TransportError> {
        let mut parts = key.split('/');
        let queue = parts.next().unwrap_or_default();
        if queue.is_empty() {
            return Err(TransportError::Protocol {
                message: format!("CLIENT_ERROR bad key '{}'", key),
            });
        }

        let mut request = Self {
            queue: queue.to_string(),
            ..Default::default()
        };

        for option in parts {
            match option {
                "open" => request.open = true,
                "close" => request.close = true,
                "abort" => request.abort = true,
                "peek" => request.peek = true,
                _ => match option.strip_prefix("t=").map(str::parse::<u64>) {
                    Some(Ok(millis)) => request.wait = Some(Duration::from_millis(millis)),
                    _ => {
                        return Err(TransportError::Protocol {
                            message: format!("CLIENT_ERROR unknown read option '{}'", option),
                        })
                    }
                },
            }
        }

        if request.open && request.peek {
            return Err(TransportError::Protocol {
                message: "CLIENT_ERROR cannot open and peek in one read".to_string(),
            });
        }

        Ok(request)
    }
}

// ============================================================================
// InMemoryBackend
// ============================================================================

/// Process-local queue server. Cloning shares the same queues.
#[derive(Clone)]
pub struct InMemoryBackend {
    state: Arc<BackendState>,
}

impl InMemoryBackend {
    /// Create new backend with the default open grace window
    pub fn new() -> Self {
        Self::with_open_grace(DEFAULT_OPEN_GRACE)
    }

    /// Create new backend that re-delivers opened items after `open_grace`
    pub fn with_open_grace(open_grace: Duration) -> Self {
        Self {
            state: Arc::new(BackendState {
                queues: Mutex::new(HashMap::new()),
                faults: Mutex::new(FaultPlan::default()),
                requests: Mutex::new(VecDeque::new()),
                arrivals: Notify::new(),
                open_grace,
                connections_created: AtomicUsize::new(0),
                live_connections: AtomicUsize::new(0),
            }),
        }
    }

    /// Store a raw value, bypassing the message envelope
    pub fn push_raw(&self, queue: &str, value: &str) {
        self.enqueue(queue, value, 0);
    }

    /// Number of items waiting to be handed out
    pub fn queue_depth(&self, queue: &str) -> usize {
        let now = Instant::now();
        let mut queues = self.state.queues();
        match queues.get_mut(queue) {
            Some(q) => {
                q.expire(now, self.state.open_grace);
                q.items.len()
            }
            None => 0,
        }
    }

    /// Number of items currently opened and not yet closed
    pub fn open_count(&self, queue: &str) -> usize {
        self.state
            .queues()
            .get(queue)
            .map_or(0, InMemoryQueue::open_count)
    }

    /// The last [`REQUEST_LOG_LIMIT`] `get` keys received, in arrival order
    pub fn requests(&self) -> Vec<String> {
        self.state
            .requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn connections_created(&self) -> usize {
        self.state.connections_created.load(Ordering::SeqCst)
    }

    /// Connections that are neither shut down nor dropped
    pub fn live_connections(&self) -> usize {
        self.state.live_connections.load(Ordering::SeqCst)
    }

    /// Fail the next `count` reads with a transport timeout
    pub fn inject_read_timeouts(&self, count: usize) {
        self.state.faults().read_timeouts += count;
    }

    /// Fail the next `count` reads with a server error
    pub fn inject_protocol_errors(&self, count: usize) {
        self.state.faults().protocol_errors += count;
    }

    /// Fail the next `count` connection attempts
    pub fn inject_connect_failures(&self, count: usize) {
        self.state.faults().connect_failures += count;
    }

    fn enqueue(&self, queue: &str, value: &str, ttl_secs: u32) {
        let expires_at =
            (ttl_secs > 0).then(|| Instant::now() + Duration::from_secs(u64::from(ttl_secs)));

        self.state
            .queues()
            .entry(queue.to_string())
            .or_default()
            .items
            .push_back(StoredItem {
                value: value.to_string(),
                expires_at,
            });
        self.state.arrivals.notify_waiters();
    }

    fn record_request(&self, key: &str) {
        let mut requests = self
            .state
            .requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if requests.len() == REQUEST_LOG_LIMIT {
            requests.pop_front();
        }
        requests.push_back(key.to_string());
    }

    /// Apply close/abort and try to take an item. Never blocks.
    fn try_read(
        &self,
        connection_id: &str,
        request: &mut ReadRequest,
    ) -> Result<Option<String>, TransportError> {
        let now = Instant::now();
        let mut queues = self.state.queues();
        let queue = queues.entry(request.queue.clone()).or_default();

        // A bare close or abort only acknowledges, it never fetches
        let acknowledge_only = !request.open && !request.peek && (request.close || request.abort);

        // close and abort apply once, even when the read then has to wait
        if std::mem::take(&mut request.close) && queue.close(connection_id).is_some() {
            trace!(queue = %request.queue, "Closed open item");
        }
        if std::mem::take(&mut request.abort) && queue.abort(connection_id) {
            self.state.arrivals.notify_waiters();
        }
        if acknowledge_only {
            request.wait = None;
            return Ok(None);
        }

        queue.expire(now, self.state.open_grace);

        if request.peek {
            return Ok(queue.items.front().map(|item| item.value.clone()));
        }

        if request.open && queue.open.contains_key(connection_id) {
            return Err(TransportError::Protocol {
                message: format!(
                    "CLIENT_ERROR transaction already open on '{}'",
                    request.queue
                ),
            });
        }

        let Some(item) = queue.items.pop_front() else {
            return Ok(None);
        };
        let value = item.value.clone();
        if request.open {
            queue.open.insert(
                connection_id.to_string(),
                OpenItem {
                    item,
                    opened_at: now,
                },
            );
        }
        Ok(Some(value))
    }

    async fn read(&self, connection_id: &str, key: &str) -> Result<Option<String>, TransportError> {
        self.record_request(key);
        {
            let mut faults = self.state.faults();
            if faults.read_timeouts > 0 {
                faults.read_timeouts -= 1;
                return Err(TransportError::Timeout {
                    duration: Duration::ZERO,
                });
            }
            if faults.protocol_errors > 0 {
                faults.protocol_errors -= 1;
                return Err(TransportError::Protocol {
                    message: "SERVER_ERROR injected".to_string(),
                });
            }
        }

        let mut request = ReadRequest::parse(key)?;
        let started = Instant::now();

        loop {
            // Registered before the check so an arrival in between is not missed
            let arrival = self.state.arrivals.notified();

            if let Some(value) = self.try_read(connection_id, &mut request)? {
                return Ok(Some(value));
            }

            let now = Instant::now();
            let deadline = started + request.wait.unwrap_or(Duration::ZERO);
            if now >= deadline {
                return Ok(None);
            }

            // Wake up at least once per grace window so stale opens are returned
            let wake_at = deadline.min(now + self.state.open_grace);
            tokio::select! {
                _ = arrival => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBackend")
            .field("open_grace", &self.state.open_grace)
            .field("live_connections", &self.live_connections())
            .finish()
    }
}

#[async_trait]
impl ConnectionFactory for InMemoryBackend {
    async fn connect(&self) -> Result<Box<dyn Connection>, TransportError> {
        {
            let mut faults = self.state.faults();
            if faults.connect_failures > 0 {
                faults.connect_failures -= 1;
                return Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "injected connection failure",
                )));
            }
        }

        self.state.connections_created.fetch_add(1, Ordering::SeqCst);
        self.state.live_connections.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(InMemoryConnection {
            id: uuid::Uuid::new_v4().to_string(),
            backend: self.clone(),
            shut_down: false,
        }))
    }
}

// ============================================================================
// InMemoryConnection
// ============================================================================

/// Connection to an [`InMemoryBackend`]
pub struct InMemoryConnection {
    id: String,
    backend: InMemoryBackend,
    shut_down: bool,
}

impl InMemoryConnection {
    pub fn id(&self) -> &str {
        &self.id
    }
}

#[async_trait]
impl Connection for InMemoryConnection {
    async fn get(&mut self, key: &str, timeout: Duration) -> Result<Option<String>, TransportError> {
        if self.shut_down {
            return Err(TransportError::Shutdown);
        }

        match tokio::time::timeout(timeout, self.backend.read(&self.id, key)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout { duration: timeout }),
        }
    }

    async fn set(&mut self, key: &str, ttl_secs: u32, value: &str) -> Result<bool, TransportError> {
        if self.shut_down {
            return Err(TransportError::Shutdown);
        }

        if key.contains('/') {
            return Err(TransportError::Protocol {
                message: format!("CLIENT_ERROR read options not allowed in set key '{}'", key),
            });
        }

        self.backend.enqueue(key, value, ttl_secs);
        Ok(true)
    }

    async fn shutdown(&mut self) -> Result<(), TransportError> {
        if !self.shut_down {
            self.shut_down = true;
            self.backend.state.release_connection(&self.id);
        }
        Ok(())
    }

    fn is_shutdown(&self) -> bool {
        self.shut_down
    }
}

impl Drop for InMemoryConnection {
    fn drop(&mut self) {
        if !self.shut_down {
            self.shut_down = true;
            self.backend.state.release_connection(&self.id);
        }
    }
}
