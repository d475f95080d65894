//! Identity types for replicated entities and components

use serde::{Deserialize, Serialize};
use std::fmt;

const NUMBER_BITS: u32 = 16;
const NUMBER_MASK: u32 = (1 << NUMBER_BITS) - 1;

/// Network-shared entity slot
///
/// The low 16 bits are the entity number (the slot the scene reuses), the high
/// 16 bits are the version (generation). Destroying an entity and reusing its
/// number bumps the version, so the same number can map to several engine
/// entities over the lifetime of a scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CrdtEntity(pub u32);

impl CrdtEntity {
    /// Create an entity from its number and version
    pub fn new(number: u16, version: u16) -> Self {
        Self(((version as u32) << NUMBER_BITS) | number as u32)
    }

    /// Get the raw id
    pub fn raw(&self) -> u32 {
        self.0
    }

    /// The reusable entity slot
    pub fn number(&self) -> u16 {
        (self.0 & NUMBER_MASK) as u16
    }

    /// The generation of the slot
    pub fn version(&self) -> u16 {
        (self.0 >> NUMBER_BITS) as u16
    }
}

impl From<u32> for CrdtEntity {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl fmt::Display for CrdtEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "crdt:{}v{}", self.number(), self.version())
    }
}

/// Identifier of an SDK component kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComponentId(pub i32);

impl ComponentId {
    /// Create a new component ID
    pub fn new(id: i32) -> Self {
        Self(id)
    }

    /// Get the raw ID value
    pub fn raw(&self) -> i32 {
        self.0
    }
}

impl From<i32> for ComponentId {
    fn from(id: i32) -> Self {
        Self(id)
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "component:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_number_and_version() {
        let entity = CrdtEntity::new(512, 3);
        assert_eq!(entity.number(), 512);
        assert_eq!(entity.version(), 3);
        assert_eq!(entity.raw(), (3 << 16) | 512);
        assert_eq!(format!("{}", entity), "crdt:512v3");
    }

    #[test]
    fn test_entity_from_raw() {
        let entity = CrdtEntity::from(5);
        assert_eq!(entity.number(), 5);
        assert_eq!(entity.version(), 0);
        assert_eq!(entity, CrdtEntity::new(5, 0));
    }

    #[test]
    fn test_reused_slot_is_a_different_entity() {
        let first = CrdtEntity::new(7, 0);
        let reused = CrdtEntity::new(7, 1);
        assert_eq!(first.number(), reused.number());
        assert_ne!(first, reused);
    }

    #[test]
    fn test_component_id() {
        let id = ComponentId::new(1041);
        assert_eq!(id.raw(), 1041);
        assert_eq!(format!("{}", id), "component:1041");
        assert_eq!(ComponentId::from(1041), id);
    }

    #[test]
    fn test_ids_serialize_transparently() {
        let serialized = ron::to_string(&CrdtEntity::new(1, 0)).expect("serialize");
        assert_eq!(serialized, "1");
        let id: ComponentId = ron::from_str("42").expect("deserialize");
        assert_eq!(id, ComponentId(42));
    }
}
