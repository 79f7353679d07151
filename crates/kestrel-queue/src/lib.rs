//! # Kestrel Queue
//!
//! Publish/consume client for Kestrel-style queues spoken over the memcached
//! text protocol.
//!
//! This library provides:
//! - `put` of typed messages wrapped in a JSON envelope
//! - Background listeners, one task and one connection per listener
//! - Reliable consumption through the `/open` and `/close` read options, so
//!   a message is only removed once its listener has processed it
//! - An in-memory backend with the same read semantics for tests and demos
//!
//! ## Module Organization
//!
//! - [`error`] - Error types for queue and transport operations
//! - [`message`] - Queue names, the message envelope and the type registry
//! - [`provider`] - Backend selection and configuration loading
//! - [`client`] - Connection traits and the per-context connection provider
//! - [`providers`] - Memcached and in-memory backends
//! - [`listener`] - The listener worker loop
//! - [`manager`] - The queue manager tying it all together
//!
//! ## Usage
//!
//! ```rust,ignore
//! use kestrel_queue::{register_message, QueueConfig, QueueManager, QueueMessage, MessageRegistry};
//!
//! #[derive(Debug, serde::Serialize, serde::Deserialize)]
//! struct Resize { width: u32 }
//!
//! impl QueueMessage for Resize {
//!     fn identifier() -> &'static str { "resize" }
//! }
//! register_message!(Resize);
//!
//! let registry = Arc::new(MessageRegistry::with_discovered());
//! let manager = QueueManager::from_config(QueueConfig::load(None)?, registry)?;
//! manager.listen("images", Arc::new(ResizeWorker), true)?;
//! manager.put("images", &Resize { width: 640 }).await?;
//! ```

pub mod client;
pub mod error;
pub mod listener;
pub mod manager;
pub mod message;
pub mod provider;
pub mod providers;
pub mod shutdown;

// Used by `register_message!`
#[doc(hidden)]
pub use inventory;

pub use client::{Connection, ConnectionFactory, ConnectionProvider};
pub use error::{
    ConfigurationError, QueueError, SerializationError, TransportError, ValidationError,
};
pub use listener::{ListenerState, QueueListener, ReadKey};
pub use manager::{ListenerHandle, QueueManager};
pub use message::{Message, MessageRegistry, MessageVariant, QueueMessage, QueueName};
pub use provider::{ProviderType, QueueConfig, ServerAddress};
pub use providers::{InMemoryBackend, MemcachedFactory};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
