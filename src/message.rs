//! Protocol messages and their per-instance tags.
//!
//! A [`Message`] is a self-describing payload owned by one protocol family.
//! Messages travel through connections as [`MessageRef`] so a single decoded
//! frame can be fanned out to many ports without copying. [`Tags`] carry
//! cross-cutting metadata (for example the connection a message arrived on)
//! and use interior mutability so features can annotate a shared message.

use std::{
    any::Any,
    collections::HashMap,
    fmt,
    hash::Hash,
    sync::{Arc, Mutex, PoisonError},
};

use bytes::BytesMut;

use crate::error::FramingError;

/// Identity of a protocol family.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProtocolInfo {
    id: Arc<str>,
    name: Arc<str>,
}

impl ProtocolInfo {
    /// Create a protocol identity.
    pub fn new(id: impl Into<Arc<str>>, name: impl Into<Arc<str>>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    /// Short machine identifier, for example `"example"`.
    #[must_use]
    pub fn id(&self) -> &str { &self.id }

    /// Human readable protocol name.
    #[must_use]
    pub fn name(&self) -> &str { &self.name }
}

impl fmt::Display for ProtocolInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.name, self.id)
    }
}

/// Shared handle to a decoded or outbound message.
pub type MessageRef = Arc<dyn Message>;

/// Capability set every protocol message provides.
pub trait Message: Send + Sync + fmt::Debug + 'static {
    /// Protocol family owning this message.
    fn protocol(&self) -> &ProtocolInfo;

    /// Message name used in logs.
    fn name(&self) -> &'static str;

    /// Number of bytes [`Message::serialize`] writes.
    fn byte_size(&self) -> usize;

    /// Append the complete wire frame to `dst`.
    ///
    /// # Errors
    ///
    /// Returns a [`FramingError`] if the message cannot be represented on
    /// the wire.
    fn serialize(&self, dst: &mut BytesMut) -> Result<(), FramingError>;

    /// Populate this message from a complete wire frame, returning the
    /// number of bytes consumed.
    ///
    /// # Errors
    ///
    /// Returns a [`FramingError`] when the frame is malformed.
    fn deserialize(&mut self, src: &[u8]) -> Result<usize, FramingError>;

    /// Metadata bag attached to this instance.
    fn tags(&self) -> &Tags;

    /// Access to the concrete type for downcasting.
    fn as_any(&self) -> &dyn Any;
}

impl dyn Message + '_ {
    /// Downcast to a concrete message type.
    #[must_use]
    pub fn downcast_ref<T: Message>(&self) -> Option<&T> { self.as_any().downcast_ref::<T>() }

    /// Returns true if the message is of type `T`.
    #[must_use]
    pub fn is<T: Message>(&self) -> bool { self.as_any().is::<T>() }
}

/// Key of the tag holding the id of the connection a message arrived on.
pub const ORIGIN_TAG: &str = "origin";

/// Value stored in a [`Tags`] bag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TagValue {
    /// Free-form text.
    Text(Arc<str>),
    /// Signed integer.
    Integer(i64),
    /// Boolean flag.
    Flag(bool),
}

impl From<&str> for TagValue {
    fn from(value: &str) -> Self { Self::Text(value.into()) }
}

impl From<String> for TagValue {
    fn from(value: String) -> Self { Self::Text(value.into()) }
}

impl From<i64> for TagValue {
    fn from(value: i64) -> Self { Self::Integer(value) }
}

impl From<bool> for TagValue {
    fn from(value: bool) -> Self { Self::Flag(value) }
}

/// Per-message key/value metadata.
///
/// Tags exist only for the lifetime of one in-flight message and are never
/// serialised.
#[derive(Default)]
pub struct Tags(Mutex<HashMap<&'static str, TagValue>>);

impl Tags {
    /// Create an empty bag.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    fn with_map<R>(&self, f: impl FnOnce(&mut HashMap<&'static str, TagValue>) -> R) -> R {
        let mut map = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut map)
    }

    /// Insert or replace a tag, returning the previous value.
    pub fn set(&self, key: &'static str, value: impl Into<TagValue>) -> Option<TagValue> {
        self.with_map(|map| map.insert(key, value.into()))
    }

    /// Read a tag.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<TagValue> { self.with_map(|map| map.get(key).cloned()) }

    /// Remove a tag.
    pub fn remove(&self, key: &str) -> Option<TagValue> { self.with_map(|map| map.remove(key)) }

    /// Returns true if `key` is present.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool { self.with_map(|map| map.contains_key(key)) }

    /// Number of tags.
    #[must_use]
    pub fn len(&self) -> usize { self.with_map(|map| map.len()) }

    /// Returns true if no tags are set.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Remove every tag.
    pub fn clear(&self) { self.with_map(HashMap::clear); }

    /// Record the connection a message arrived on.
    pub fn set_origin(&self, connection_id: &str) { self.set(ORIGIN_TAG, connection_id); }

    /// Connection the message arrived on, if tagged.
    #[must_use]
    pub fn origin(&self) -> Option<Arc<str>> {
        match self.get(ORIGIN_TAG) {
            Some(TagValue::Text(id)) => Some(id),
            _ => None,
        }
    }

    /// Returns true if the message was tagged as arriving on `connection_id`.
    #[must_use]
    pub fn is_origin(&self, connection_id: &str) -> bool {
        self.origin().is_some_and(|id| &*id == connection_id)
    }
}

impl Clone for Tags {
    fn clone(&self) -> Self { Self(Mutex::new(self.with_map(|map| map.clone()))) }
}

impl fmt::Debug for Tags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.with_map(|map| f.debug_map().entries(map.iter()).finish())
    }
}

/// Zero-argument constructor for a message type.
pub type MessageFactory = fn() -> Box<dyn Message>;

/// Closed mapping from a protocol's message id to a message constructor.
///
/// Populated when a protocol is registered. Further message types can be
/// added with [`MessageRegistry::register`] without touching the parser.
#[derive(Clone, Debug)]
pub struct MessageRegistry<K> {
    protocol: ProtocolInfo,
    factories: HashMap<K, MessageFactory>,
}

impl<K> MessageRegistry<K>
where
    K: Eq + Hash + fmt::Display,
{
    /// Create an empty registry for `protocol`.
    #[must_use]
    pub fn new(protocol: ProtocolInfo) -> Self {
        Self {
            protocol,
            factories: HashMap::new(),
        }
    }

    /// Protocol served by this registry.
    #[must_use]
    pub fn protocol(&self) -> &ProtocolInfo { &self.protocol }

    /// Register `factory` under `id`, replacing any previous entry.
    #[must_use]
    pub fn with(mut self, id: K, factory: MessageFactory) -> Self {
        self.register(id, factory);
        self
    }

    /// Register `factory` under `id`, returning the replaced factory.
    pub fn register(&mut self, id: K, factory: MessageFactory) -> Option<MessageFactory> {
        self.factories.insert(id, factory)
    }

    /// Returns true if `id` has a factory.
    pub fn contains(&self, id: &K) -> bool { self.factories.contains_key(id) }

    /// Number of registered message types.
    #[must_use]
    pub fn len(&self) -> usize { self.factories.len() }

    /// Returns true if no message types are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.factories.is_empty() }

    /// Construct an empty message for `id`.
    ///
    /// # Errors
    ///
    /// Returns [`FramingError::UnsupportedId`] when `id` is not registered.
    pub fn create(&self, id: &K) -> Result<Box<dyn Message>, FramingError> {
        self.factories
            .get(id)
            .map(|factory| factory())
            .ok_or_else(|| FramingError::UnsupportedId {
                protocol: self.protocol.id().to_owned(),
                id: id.to_string(),
            })
    }
}
