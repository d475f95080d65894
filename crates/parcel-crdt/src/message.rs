//! CRDT messages exchanged between the scene runtime and the client

use crate::{ComponentId, CrdtEntity, Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// The kind of CRDT message
///
/// Discriminants match the values used on the wire by the scene protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum CrdtMessageType {
    /// Placeholder, never processed
    #[default]
    None = 0,
    /// Last-write-wins component upsert
    PutComponent = 1,
    /// Last-write-wins component removal
    DeleteComponent = 2,
    /// Entity removal, the entity number can't revive with the same version
    DeleteEntity = 3,
    /// Grow-only component value (every value is kept)
    AppendComponent = 4,
}

impl CrdtMessageType {
    /// Whether the message participates in the last-write-wins set
    pub fn is_lww(&self) -> bool {
        matches!(
            self,
            CrdtMessageType::PutComponent | CrdtMessageType::DeleteComponent
        )
    }
}

impl TryFrom<u32> for CrdtMessageType {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(CrdtMessageType::None),
            1 => Ok(CrdtMessageType::PutComponent),
            2 => Ok(CrdtMessageType::DeleteComponent),
            3 => Ok(CrdtMessageType::DeleteEntity),
            4 => Ok(CrdtMessageType::AppendComponent),
            other => Err(Error::UnsupportedMessageType(other)),
        }
    }
}

/// Immutable message payload
///
/// Cheap to clone: every clone shares the same allocation. The bytes are the
/// binary encoding of the component fields and are never interpreted here.
/// An empty payload represents a deleted component.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Payload(Arc<[u8]>);

impl Payload {
    /// An empty payload
    pub fn empty() -> Self {
        Self::default()
    }

    /// Borrow the raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if the payload is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Check whether two payloads share the same allocation
    pub fn ptr_eq(&self, other: &Payload) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Payload({} bytes)", self.0.len())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes.into())
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.into())
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self(text.as_bytes().into())
    }
}

impl AsRef<[u8]> for Payload {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.0.as_ref().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Vec::<u8>::deserialize(deserializer).map(Payload::from)
    }
}

/// Total order over payloads used to break timestamp ties
///
/// The longer payload wins; payloads of equal length compare bytewise. Both
/// peers of a scene use the same rule so they converge on the same value.
pub fn compare_data(a: &Payload, b: &Payload) -> Ordering {
    if a.ptr_eq(b) {
        return Ordering::Equal;
    }

    a.len()
        .cmp(&b.len())
        .then_with(|| a.as_bytes().cmp(b.as_bytes()))
}

/// A CRDT message
///
/// Messages for the same `(entity, component_id)` pair are ordered by
/// `timestamp`, which the producer assigns monotonically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrdtMessage {
    /// The kind of message
    pub message_type: CrdtMessageType,
    /// Target entity
    pub entity: CrdtEntity,
    /// Target component (ignored for entity deletion)
    pub component_id: ComponentId,
    /// Lamport timestamp for the `(entity, component_id)` pair
    pub timestamp: u32,
    /// Encoded component value
    pub payload: Payload,
}

impl CrdtMessage {
    /// Create a new message
    pub fn new(
        message_type: CrdtMessageType,
        entity: impl Into<CrdtEntity>,
        component_id: impl Into<ComponentId>,
        timestamp: u32,
        payload: impl Into<Payload>,
    ) -> Self {
        Self {
            message_type,
            entity: entity.into(),
            component_id: component_id.into(),
            timestamp,
            payload: payload.into(),
        }
    }

    /// Create a put-component message
    pub fn put(
        entity: impl Into<CrdtEntity>,
        component_id: impl Into<ComponentId>,
        timestamp: u32,
        payload: impl Into<Payload>,
    ) -> Self {
        Self::new(
            CrdtMessageType::PutComponent,
            entity,
            component_id,
            timestamp,
            payload,
        )
    }

    /// Create a delete-component message
    pub fn delete_component(
        entity: impl Into<CrdtEntity>,
        component_id: impl Into<ComponentId>,
        timestamp: u32,
    ) -> Self {
        Self::new(
            CrdtMessageType::DeleteComponent,
            entity,
            component_id,
            timestamp,
            Payload::empty(),
        )
    }

    /// Create a delete-entity message
    pub fn delete_entity(entity: impl Into<CrdtEntity>) -> Self {
        Self::new(
            CrdtMessageType::DeleteEntity,
            entity,
            ComponentId(0),
            0,
            Payload::empty(),
        )
    }

    /// Create an append-component message
    pub fn append(
        entity: impl Into<CrdtEntity>,
        component_id: impl Into<ComponentId>,
        timestamp: u32,
        payload: impl Into<Payload>,
    ) -> Self {
        Self::new(
            CrdtMessageType::AppendComponent,
            entity,
            component_id,
            timestamp,
            payload,
        )
    }

    /// The `(entity, component)` key this message targets
    pub fn key(&self) -> (CrdtEntity, ComponentId) {
        (self.entity, self.component_id)
    }

    /// Whether this message supersedes `other` for the same key
    ///
    /// Returns `false` for messages targeting different keys.
    pub fn is_newer_than(&self, other: &CrdtMessage) -> bool {
        self.key() == other.key() && self.timestamp > other.timestamp
    }
}
