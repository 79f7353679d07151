//! Queue backend implementations.
//!
//! This module contains concrete implementations of the `Connection` and
//! `ConnectionFactory` traits for different queue backends.

pub mod memcached;
pub mod memory;

pub use memcached::{MemcachedConnection, MemcachedFactory};
pub use memory::{InMemoryBackend, InMemoryConnection};
