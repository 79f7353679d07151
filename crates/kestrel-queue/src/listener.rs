//! Listener workers: the reliable consume loop behind `QueueManager::listen`.
//!
//! Each registered listener gets one worker task that owns a private backend
//! connection and loops until its death flag is set:
//!
//! 1. build the read key for this cycle
//! 2. block on `get` for up to the poll window plus a grace period
//! 3. decode whatever came back and hand it to the listener
//!
//! In reliable mode every read opens the item it returns. A delivered item is
//! acknowledged by the `/close` on the *next* read. An entry that cannot be
//! decoded is acknowledged the same way, so it never comes back. When the
//! listener fails, the worker aborts the item straight away, which hands it
//! back to the queue for any worker, then backs off before opening again.
//! A worker therefore never holds more than one open item.

use crate::client::{ConnectionFactory, ConnectionProvider};
use crate::error::{SerializationError, TransportError};
use crate::message::{Message, MessageRegistry, QueueName};
use crate::provider::QueueConfig;
use crate::shutdown::ShutdownToken;
use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[cfg(test)]
#[path = "listener_tests.rs"]
mod tests;

/// Callback invoked for every message received on a queue.
///
/// Returning an error from a reliable listener hands the message back to the
/// queue unacknowledged so that it is delivered again. For a non-reliable listener
/// the message is already gone from the queue and is lost.
#[async_trait]
pub trait QueueListener: Send + Sync + 'static {
    async fn process(&self, queue: &QueueName, message: Box<dyn Message>) -> anyhow::Result<()>;
}

/// Lifecycle of a listener worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Waiting for a backend connection
    Connecting,
    /// Blocked on a read
    Waiting,
    /// Decoding and dispatching a message
    Processing,
    /// Replacing a connection after a read timeout
    Recovering,
    /// Exited; the connection has been released
    Dead,
}

/// Builds the `get` keys for one queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadKey {
    base: String,
    reliable: bool,
}

impl ReadKey {
    pub fn new(queue: &QueueName, poll_timeout: Duration, reliable: bool) -> Self {
        Self {
            base: format!("{}/t={}", queue, poll_timeout.as_millis()),
            reliable,
        }
    }

    /// `<queue>/t=<ms>`
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Key for the next read, given whether the previous cycle delivered a
    /// message successfully
    pub fn next(&self, previous_succeeded: bool) -> String {
        match (self.reliable, previous_succeeded) {
            (false, _) => self.base.clone(),
            (true, false) => format!("{}/open", self.base),
            (true, true) => format!("{}/close/open", self.base),
        }
    }

    /// Acknowledge the open item without opening another one
    pub fn close_only(queue: &QueueName) -> String {
        format!("{}/close", queue)
    }

    /// Hand the open item back to the queue without opening another one
    pub fn abort_only(queue: &QueueName) -> String {
        format!("{}/abort", queue)
    }
}

/// What became of one received entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    /// The listener returned `Ok`
    Accepted,
    /// Not a known message; dropped
    Undecodable,
    /// The listener returned an error or panicked
    Rejected,
}

/// Result of a single read
enum ReadOutcome {
    Message(String),
    Empty,
    Interrupted,
    Failed(TransportError),
}

/// State owned by one listener task
pub(crate) struct ListenerWorker {
    queue: QueueName,
    reliable: bool,
    listener: Arc<dyn QueueListener>,
    registry: Arc<MessageRegistry>,
    connections: ConnectionProvider,
    config: QueueConfig,
    token: ShutdownToken,
    state: watch::Sender<ListenerState>,
}

impl ListenerWorker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        queue: QueueName,
        reliable: bool,
        listener: Arc<dyn QueueListener>,
        registry: Arc<MessageRegistry>,
        factory: Arc<dyn ConnectionFactory>,
        config: QueueConfig,
        token: ShutdownToken,
        state: watch::Sender<ListenerState>,
    ) -> Self {
        Self {
            queue,
            reliable,
            listener,
            registry,
            connections: ConnectionProvider::new(factory),
            config,
            token,
            state,
        }
    }

    /// Consume until the death flag is set, then release the connection
    pub(crate) async fn run(mut self) {
        let key = ReadKey::new(&self.queue, self.config.poll_timeout(), self.reliable);
        info!(queue = %self.queue, reliable = self.reliable, "Listener started");

        // Whether the entry read last is still open and due a close. It is
        // only cleared once a read completes, so a close carried by a failed
        // or interrupted request is sent again.
        let mut acknowledge = false;
        while !self.token.is_shutdown() {
            if !self.acquire_connection().await {
                break;
            }

            let request = key.next(acknowledge);
            self.set_state(ListenerState::Waiting);
            debug!(queue = %self.queue, key = %request, "Waiting for next message");

            match self.read(&request).await {
                ReadOutcome::Message(raw) => {
                    self.set_state(ListenerState::Processing);
                    let delivery = self.dispatch(&raw).await;
                    acknowledge = self.reliable && delivery != Delivery::Rejected;
                    if self.reliable && delivery == Delivery::Rejected {
                        self.return_open().await;
                        self.pause(self.config.error_backoff()).await;
                    }
                }
                ReadOutcome::Empty => acknowledge = false,
                ReadOutcome::Interrupted => {}
                ReadOutcome::Failed(TransportError::Timeout { duration }) => {
                    // A read that outlives the server's own poll window means
                    // the connection is wedged. Replace it; the server returns
                    // whatever it had open.
                    self.set_state(ListenerState::Recovering);
                    warn!(queue = %self.queue, ?duration, "Read timed out, replacing connection");
                    self.connections.release().await;
                    acknowledge = false;
                }
                ReadOutcome::Failed(TransportError::Interrupted) => {}
                ReadOutcome::Failed(err @ TransportError::Protocol { .. }) => {
                    error!(queue = %self.queue, error = %err, "Backend error during get()");
                    self.pause(self.config.error_backoff()).await;
                }
                ReadOutcome::Failed(err) => {
                    error!(queue = %self.queue, error = %err, "Unexpected failure during get()");
                    self.pause(self.config.error_backoff()).await;
                }
            }
        }

        if acknowledge {
            self.acknowledge_last().await;
        }
        self.connections.release().await;
        self.set_state(ListenerState::Dead);
        info!(queue = %self.queue, "Listener stopped");
    }

    fn set_state(&self, state: ListenerState) {
        self.state.send_replace(state);
    }

    /// Make sure a live connection is held, retrying until one can be built.
    /// Returns false if the death flag was set while trying.
    async fn acquire_connection(&mut self) -> bool {
        if self.connections.is_connected() {
            return true;
        }

        self.set_state(ListenerState::Connecting);
        loop {
            let attempt = tokio::select! {
                result = self.connections.connection() => result.map(|_| ()),
                _ = self.token.wait() => return false,
            };

            match attempt {
                Ok(()) => return true,
                Err(e) => {
                    error!(
                        queue = %self.queue,
                        error = %e,
                        retry_in = ?self.config.failed_connect_delay(),
                        "Failed to build backend connection, will retry"
                    );
                    if !self.pause(self.config.failed_connect_delay()).await {
                        return false;
                    }
                }
            }
        }
    }

    /// Sleep, waking early on death. Returns false if woken by death.
    async fn pause(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.token.wait() => false,
        }
    }

    async fn read(&mut self, request: &str) -> ReadOutcome {
        let timeout = self.config.read_timeout();
        let connection = match self.connections.connection().await {
            Ok(connection) => connection,
            Err(e) => return ReadOutcome::Failed(e),
        };

        tokio::select! {
            result = connection.get(request, timeout) => match result {
                Ok(Some(raw)) => ReadOutcome::Message(raw),
                Ok(None) => ReadOutcome::Empty,
                Err(e) => ReadOutcome::Failed(e),
            },
            _ = self.token.wait() => ReadOutcome::Interrupted,
        }
    }

    /// Decode and hand a message to the listener
    async fn dispatch(&self, raw: &str) -> Delivery {
        debug!(queue = %self.queue, message = %raw, "Incoming message");

        let message = match self.registry.decode(raw) {
            Ok(message) => message,
            Err(SerializationError::JsonError(e)) => {
                error!(queue = %self.queue, error = %e, "JSON parsing error while parsing message, ignoring");
                return Delivery::Undecodable;
            }
            Err(e) => {
                error!(queue = %self.queue, error = %e, message = %raw, "Not a known message type, ignoring");
                return Delivery::Undecodable;
            }
        };

        debug!(queue = %self.queue, identifier = message.identifier(), "Calling listener");
        let outcome = AssertUnwindSafe(self.listener.process(&self.queue, message))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => Delivery::Accepted,
            Ok(Err(e)) => {
                warn!(
                    queue = %self.queue,
                    reliable = self.reliable,
                    error = %e,
                    "Listener failed to process message"
                );
                Delivery::Rejected
            }
            Err(panic) => {
                let panic_msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "Unknown panic".to_string());
                error!(queue = %self.queue, panic_msg = %panic_msg, "Listener panicked while processing message");
                Delivery::Rejected
            }
        }
    }

    /// Close the last delivered item on the way out so it is not handed out
    /// again after this worker stops.
    async fn acknowledge_last(&mut self) {
        let key = ReadKey::close_only(&self.queue);
        let timeout = self.config.op_timeout();
        if !self.connections.is_connected() {
            return;
        }
        if let Ok(connection) = self.connections.connection().await {
            if let Err(e) = connection.get(&key, timeout).await {
                warn!(queue = %self.queue, error = %e, "Failed to acknowledge last message");
            }
        }
    }

    /// Abort the open item so another read can pick it up. If the abort does
    /// not go through, dropping the connection returns the item instead.
    async fn return_open(&mut self) {
        let key = ReadKey::abort_only(&self.queue);
        let timeout = self.config.op_timeout();
        let result = match self.connections.connection().await {
            Ok(connection) => connection.get(&key, timeout).await.map(|_| ()),
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            warn!(queue = %self.queue, error = %e, "Failed to return message, dropping connection");
            self.connections.release().await;
        }
    }
}
