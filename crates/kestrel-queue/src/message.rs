//! Message types for queue operations: queue names, the polymorphic message
//! envelope and the identifier registry used to decode it.
//!
//! Every value stored under a queue key is a JSON envelope:
//!
//! ```json
//! {"identifier": "em", "payload": {"value": 3}}
//! ```
//!
//! The identifier selects the concrete type on the consuming side. By default
//! it is the fully-qualified Rust type name; a type may shorten it by
//! overriding [`QueueMessage::identifier`], in which case the consumer has to
//! register the type before such payloads can be decoded.

use crate::error::{SerializationError, ValidationError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::fmt::Debug;
use std::str::FromStr;
use std::sync::RwLock;
use tracing::debug;

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Longest queue name accepted. Leaves room for the `/t=<ms>/close/open`
/// suffix inside the 250 byte memcached key limit.
pub const MAX_QUEUE_NAME_LEN: usize = 200;

/// Validated queue name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueName(String);

impl QueueName {
    /// Create new queue name with validation
    pub fn new(name: String) -> Result<Self, ValidationError> {
        if name.is_empty() {
            return Err(ValidationError::Required {
                field: "queue_name".to_string(),
            });
        }
        if name.len() > MAX_QUEUE_NAME_LEN {
            return Err(ValidationError::OutOfRange {
                field: "queue_name".to_string(),
                message: format!("must be 1-{} bytes", MAX_QUEUE_NAME_LEN),
            });
        }

        // Whitespace and control characters break the text protocol framing
        if name
            .chars()
            .any(|c| c.is_whitespace() || c.is_control())
        {
            return Err(ValidationError::InvalidFormat {
                field: "queue_name".to_string(),
                message: "whitespace and control characters are not allowed".to_string(),
            });
        }

        // '/' introduces read options such as /open and /close
        if name.contains('/') {
            return Err(ValidationError::InvalidFormat {
                field: "queue_name".to_string(),
                message: "'/' is reserved for read options".to_string(),
            });
        }

        Ok(Self(name))
    }

    /// Get queue name as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for QueueName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

impl TryFrom<&str> for QueueName {
    type Error = ValidationError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value.to_string())
    }
}

// ============================================================================
// Message Types
// ============================================================================

/// A concrete message type that can travel through a queue.
///
/// ```
/// use kestrel_queue::QueueMessage;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Serialize, Deserialize)]
/// struct ThumbnailRequest {
///     image_id: u64,
/// }
///
/// impl QueueMessage for ThumbnailRequest {
///     fn identifier() -> &'static str {
///         "thumb"
///     }
/// }
/// ```
pub trait QueueMessage: Serialize + DeserializeOwned + Debug + Send + Sync + 'static {
    /// Identifier written into the envelope.
    ///
    /// Defaults to [`std::any::type_name`], whose output is not guaranteed to
    /// stay the same across compiler versions. Override it for any message
    /// read by a process built separately from its producer.
    fn identifier() -> &'static str
    where
        Self: Sized,
    {
        std::any::type_name::<Self>()
    }
}

/// Object-safe view of a [`QueueMessage`], as handed to listeners
pub trait Message: Debug + Send + Sync + Any {
    /// Identifier of the concrete type
    fn identifier(&self) -> &'static str;

    /// Serialize the type's own fields
    fn to_payload(&self) -> Result<Value, serde_json::Error>;

    /// Decoder entry for the concrete type
    fn variant(&self) -> MessageVariant;

    fn as_any(&self) -> &dyn Any;
}

impl<T: QueueMessage> Message for T {
    fn identifier(&self) -> &'static str {
        T::identifier()
    }

    fn to_payload(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    fn variant(&self) -> MessageVariant {
        MessageVariant::of::<T>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl dyn Message {
    /// Borrow the message as its concrete type
    pub fn downcast_ref<T: QueueMessage>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// Check whether the message is of the given concrete type
    pub fn is<T: QueueMessage>(&self) -> bool {
        self.as_any().is::<T>()
    }
}

/// Wire representation of a message
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    identifier: Option<String>,
    #[serde(default)]
    payload: Value,
}

// ============================================================================
// Registry
// ============================================================================

type Decoder = fn(Value) -> Result<Box<dyn Message>, serde_json::Error>;

fn decode_payload<T: QueueMessage>(payload: Value) -> Result<Box<dyn Message>, serde_json::Error> {
    let message: T = serde_json::from_value(payload)?;
    Ok(Box::new(message))
}

/// Link-time registration entry for a message type.
///
/// Submitted with [`register_message!`](crate::register_message) and picked up
/// by [`MessageRegistry::with_discovered`].
#[derive(Clone, Copy)]
pub struct MessageVariant {
    pub identifier: fn() -> &'static str,
    pub decode: Decoder,
}

impl MessageVariant {
    pub const fn of<T: QueueMessage>() -> Self {
        Self {
            identifier: T::identifier,
            decode: decode_payload::<T>,
        }
    }
}

impl Debug for MessageVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageVariant")
            .field("identifier", &(self.identifier)())
            .finish()
    }
}

inventory::collect!(MessageVariant);

/// Register a message type for automatic discovery.
///
/// ```ignore
/// kestrel_queue::register_message!(ThumbnailRequest);
/// let registry = MessageRegistry::with_discovered();
/// ```
#[macro_export]
macro_rules! register_message {
    ($message_type:ty) => {
        $crate::inventory::submit! {
            $crate::message::MessageVariant::of::<$message_type>()
        }
    };
}

/// Identifier to decoder lookup table.
///
/// The registry is plain state: build one, register the types a process
/// consumes, and hand it to the [`QueueManager`](crate::QueueManager).
#[derive(Default)]
pub struct MessageRegistry {
    decoders: RwLock<HashMap<String, Decoder>>,
}

impl MessageRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding every type submitted with `register_message!`
    pub fn with_discovered() -> Self {
        let registry = Self::new();
        for variant in inventory::iter::<MessageVariant>() {
            registry.insert((variant.identifier)(), variant.decode);
        }
        registry
    }

    /// Register a type under its own identifier
    pub fn register<T: QueueMessage>(&self) -> &Self {
        self.insert(T::identifier(), decode_payload::<T>);
        self
    }

    /// Register a type under an additional identifier
    pub fn register_as<T: QueueMessage>(&self, identifier: &str) -> &Self {
        self.insert(identifier, decode_payload::<T>);
        self
    }

    /// Check whether an identifier can be decoded
    pub fn contains(&self, identifier: &str) -> bool {
        self.read().contains_key(identifier)
    }

    /// Number of registered identifiers
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Encode a message into its JSON envelope.
    ///
    /// Types that keep the default (type name) identifier are registered on
    /// the way through, so a process can always decode what it produced.
    pub fn encode(&self, message: &dyn Message) -> Result<String, SerializationError> {
        let variant = message.variant();
        let identifier = message.identifier();
        if identifier == (variant.identifier)() && !self.contains(identifier) {
            debug!(identifier, "Registering message type on first encode");
            self.insert(identifier, variant.decode);
        }

        let envelope = Envelope {
            identifier: Some(identifier.to_string()),
            payload: message.to_payload()?,
        };
        Ok(serde_json::to_string(&envelope)?)
    }

    /// Decode a JSON envelope into the registered concrete type
    pub fn decode(&self, json: &str) -> Result<Box<dyn Message>, SerializationError> {
        let envelope: Envelope = serde_json::from_str(json)?;
        let identifier = envelope
            .identifier
            .ok_or(SerializationError::MissingIdentifier)?;

        let decoder = self
            .read()
            .get(&identifier)
            .copied()
            .ok_or_else(|| SerializationError::UnknownIdentifier {
                identifier: identifier.clone(),
            })?;

        decoder(envelope.payload)
            .map_err(|source| SerializationError::InvalidPayload { identifier, source })
    }

    fn insert(&self, identifier: &str, decoder: Decoder) {
        self.decoders
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(identifier.to_string(), decoder);
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Decoder>> {
        self.decoders
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Debug for MessageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut identifiers: Vec<String> = self.read().keys().cloned().collect();
        identifiers.sort();
        f.debug_struct("MessageRegistry")
            .field("identifiers", &identifiers)
            .finish()
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
