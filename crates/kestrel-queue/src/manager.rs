//! The queue manager: `put`, and the registry of running listeners.

use crate::client::{ConnectionFactory, ConnectionProvider};
use crate::error::{ConfigurationError, QueueError};
use crate::listener::{ListenerState, ListenerWorker, QueueListener};
use crate::message::{Message, MessageRegistry, QueueName};
use crate::provider::{ProviderType, QueueConfig};
use crate::providers::{InMemoryBackend, MemcachedFactory};
use crate::shutdown::{shutdown_channel, ShutdownSender};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;

/// Identity of a registered listener: the address of its shared allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ListenerKey(usize);

impl ListenerKey {
    fn of(listener: &Arc<dyn QueueListener>) -> Self {
        Self(Arc::as_ptr(listener) as *const () as usize)
    }
}

/// Observer for one running listener, returned by [`QueueManager::listen`]
#[derive(Debug, Clone)]
pub struct ListenerHandle {
    queue: QueueName,
    reliable: bool,
    state: watch::Receiver<ListenerState>,
}

impl ListenerHandle {
    pub fn queue(&self) -> &QueueName {
        &self.queue
    }

    pub fn is_reliable(&self) -> bool {
        self.reliable
    }

    /// Current state of the worker
    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    /// Wait until the worker reaches `state`. Returns false if the worker
    /// went away without reaching it.
    pub async fn wait_for(&mut self, state: ListenerState) -> bool {
        let reached = self.state.wait_for(|current| *current == state).await.is_ok();
        reached || self.state() == state
    }
}

struct Registration {
    shutdown: ShutdownSender,
    task: JoinHandle<()>,
    handle: ListenerHandle,
}

impl Registration {
    async fn stop(self) {
        self.shutdown.shutdown();
        if let Err(e) = self.task.await {
            error!(queue = %self.handle.queue, error = %e, "Listener task ended abnormally");
        }
    }
}

/// Pushes messages onto queues and runs listeners that consume them.
///
/// Every listener runs as its own task with its own backend connection.
/// `put` goes through a separate connection shared by all callers.
///
/// Dropping the manager signals every listener to stop without waiting for
/// them; call [`QueueManager::shutdown`] to wait.
pub struct QueueManager {
    config: QueueConfig,
    factory: Arc<dyn ConnectionFactory>,
    registry: Arc<MessageRegistry>,
    put_connection: AsyncMutex<ConnectionProvider>,
    listeners: Mutex<HashMap<ListenerKey, Registration>>,
}

impl QueueManager {
    pub fn new(
        config: QueueConfig,
        factory: Arc<dyn ConnectionFactory>,
        registry: Arc<MessageRegistry>,
    ) -> Self {
        Self {
            put_connection: AsyncMutex::new(ConnectionProvider::new(factory.clone())),
            config,
            factory,
            registry,
            listeners: Mutex::new(HashMap::new()),
        }
    }

    /// Manager talking to the memcached-protocol servers in `config`
    pub fn memcached(
        config: QueueConfig,
        registry: Arc<MessageRegistry>,
    ) -> Result<Self, ConfigurationError> {
        let factory = MemcachedFactory::from_config(&config)?;
        Ok(Self::new(config, Arc::new(factory), registry))
    }

    /// Manager for whichever backend `config.provider` names. The in-memory
    /// backend is private to the returned manager.
    pub fn from_config(
        config: QueueConfig,
        registry: Arc<MessageRegistry>,
    ) -> Result<Self, ConfigurationError> {
        config.validate()?;
        match config.provider {
            ProviderType::Memcached => Self::memcached(config, registry),
            ProviderType::InMemory => {
                Ok(Self::new(config, Arc::new(InMemoryBackend::new()), registry))
            }
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<MessageRegistry> {
        &self.registry
    }

    fn listeners(&self) -> MutexGuard<'_, HashMap<ListenerKey, Registration>> {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Push a message with the configured default TTL
    pub async fn put(&self, queue: &str, message: &dyn Message) -> Result<(), QueueError> {
        self.put_with_ttl(queue, message, self.config.default_ttl_secs)
            .await
    }

    /// Push a message that expires after `ttl_secs` seconds
    pub async fn put_with_ttl(
        &self,
        queue: &str,
        message: &dyn Message,
        ttl_secs: u32,
    ) -> Result<(), QueueError> {
        let queue = QueueName::new(queue.to_string())?;
        let value = self.registry.encode(message)?;

        let mut provider = self.put_connection.lock().await;
        let connection = provider.connection().await?;
        let stored = connection.set(queue.as_str(), ttl_secs, &value).await?;

        if !stored {
            warn!(queue = %queue, "Backend did not store message");
            return Err(QueueError::NotStored {
                queue_name: queue.to_string(),
            });
        }

        debug!(queue = %queue, identifier = message.identifier(), ttl_secs, "Message pushed");
        Ok(())
    }

    /// Start a worker that feeds messages from `queue` to `listener`.
    ///
    /// Returns as soon as the worker is spawned. Registering a listener that
    /// is already registered stops its previous worker first. Must be called
    /// from within a tokio runtime.
    pub fn listen(
        &self,
        queue: &str,
        listener: Arc<dyn QueueListener>,
        reliable: bool,
    ) -> Result<ListenerHandle, QueueError> {
        let queue = QueueName::new(queue.to_string())?;
        let key = ListenerKey::of(&listener);

        let (shutdown, token) = shutdown_channel();
        let (state_tx, state_rx) = watch::channel(ListenerState::Connecting);
        let handle = ListenerHandle {
            queue: queue.clone(),
            reliable,
            state: state_rx,
        };

        let worker = ListenerWorker::new(
            queue.clone(),
            reliable,
            listener,
            self.registry.clone(),
            self.factory.clone(),
            self.config.clone(),
            token,
            state_tx,
        );
        let span = info_span!("listener", queue = %queue, reliable);
        let task = tokio::spawn(worker.run().instrument(span));

        let previous = self.listeners().insert(
            key,
            Registration {
                shutdown,
                task,
                handle: handle.clone(),
            },
        );

        if let Some(previous) = previous {
            info!(
                queue = %previous.handle.queue,
                "Listener registered again, stopping its previous worker"
            );
            previous.shutdown.shutdown();
        }

        info!(queue = %queue, reliable, "Listening");
        Ok(handle)
    }

    /// Stop the worker registered for `listener`. With `wait_for_death` the
    /// call returns only after the worker has released its connection.
    pub async fn unlisten(&self, listener: &Arc<dyn QueueListener>, wait_for_death: bool) {
        let removed = self.listeners().remove(&ListenerKey::of(listener));
        let Some(registration) = removed else {
            debug!("unlisten called for a listener that is not registered");
            return;
        };

        info!(queue = %registration.handle.queue, wait_for_death, "Stopping listener");
        if wait_for_death {
            registration.stop().await;
        } else {
            registration.shutdown.shutdown();
        }
    }

    /// Stop every worker, wait for all of them, then release the `put`
    /// connection. The manager can be used again afterwards.
    pub async fn shutdown(&self) {
        let registrations: Vec<Registration> =
            self.listeners().drain().map(|(_, registration)| registration).collect();

        info!(listeners = registrations.len(), "Shutting down queue manager");
        for registration in &registrations {
            registration.shutdown.shutdown();
        }
        futures::future::join_all(registrations.into_iter().map(Registration::stop)).await;

        self.put_connection.lock().await.release().await;
        info!("Queue manager shut down");
    }

    pub fn listener_count(&self) -> usize {
        self.listeners().len()
    }

    pub fn is_listening(&self, listener: &Arc<dyn QueueListener>) -> bool {
        self.listeners().contains_key(&ListenerKey::of(listener))
    }

    /// Handle for the worker registered for `listener`, if any
    pub fn listener_handle(&self, listener: &Arc<dyn QueueListener>) -> Option<ListenerHandle> {
        self.listeners()
            .get(&ListenerKey::of(listener))
            .map(|registration| registration.handle.clone())
    }
}

impl std::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager")
            .field("provider", &self.config.provider)
            .field("listeners", &self.listener_count())
            .finish()
    }
}
