//! Component bridges
//!
//! A [`ComponentBridge`] turns the opaque payload of a CRDT message into the
//! concrete value stored in the world for one component id. The synchronizer
//! never looks inside payloads itself.

use crate::world::ComponentValue;
use crate::{Error, Result};
use indexmap::IndexMap;
use parcel_crdt::{ComponentId, Payload};
use serde::de::DeserializeOwned;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Translates payloads of one component id into world component values
pub trait ComponentBridge: Send + Sync {
    /// The component id this bridge handles
    fn component_id(&self) -> ComponentId;

    /// Decode a payload into a component value
    fn deserialize(&self, payload: &Payload) -> Result<ComponentValue>;

    /// Human-readable name used in logs
    fn name(&self) -> &str {
        "component"
    }
}

impl fmt::Debug for dyn ComponentBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentBridge({} {})", self.name(), self.component_id())
    }
}

/// Stores the payload bytes as a `Vec<u8>`
#[derive(Debug, Clone)]
pub struct RawBridge {
    component_id: ComponentId,
    name: String,
}

impl RawBridge {
    pub fn new(component_id: impl Into<ComponentId>, name: impl Into<String>) -> Self {
        Self {
            component_id: component_id.into(),
            name: name.into(),
        }
    }
}

impl ComponentBridge for RawBridge {
    fn component_id(&self) -> ComponentId {
        self.component_id
    }

    fn deserialize(&self, payload: &Payload) -> Result<ComponentValue> {
        Ok(Box::new(payload.as_bytes().to_vec()))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Decodes the payload as UTF-8 into a `String`
#[derive(Debug, Clone)]
pub struct Utf8Bridge {
    component_id: ComponentId,
    name: String,
}

impl Utf8Bridge {
    pub fn new(component_id: impl Into<ComponentId>, name: impl Into<String>) -> Self {
        Self {
            component_id: component_id.into(),
            name: name.into(),
        }
    }
}

impl ComponentBridge for Utf8Bridge {
    fn component_id(&self) -> ComponentId {
        self.component_id
    }

    fn deserialize(&self, payload: &Payload) -> Result<ComponentValue> {
        let text = std::str::from_utf8(payload.as_bytes()).map_err(|e| Error::Deserialization {
            component: self.component_id,
            reason: e.to_string(),
        })?;
        Ok(Box::new(text.to_owned()))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Decodes a bincode payload into `T`
pub struct BincodeBridge<T> {
    component_id: ComponentId,
    name: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> BincodeBridge<T> {
    pub fn new(component_id: impl Into<ComponentId>, name: impl Into<String>) -> Self {
        Self {
            component_id: component_id.into(),
            name: name.into(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for BincodeBridge<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BincodeBridge")
            .field("component_id", &self.component_id)
            .field("name", &self.name)
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

impl<T> ComponentBridge for BincodeBridge<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    fn component_id(&self) -> ComponentId {
        self.component_id
    }

    fn deserialize(&self, payload: &Payload) -> Result<ComponentValue> {
        let value: T =
            bincode::deserialize(payload.as_bytes()).map_err(|e| Error::Deserialization {
                component: self.component_id,
                reason: e.to_string(),
            })?;
        Ok(Box::new(value))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Bridges by component id
///
/// Built once per scene and shared read-only with every command buffer.
#[derive(Debug, Default)]
pub struct ComponentRegistry {
    bridges: IndexMap<ComponentId, Arc<dyn ComponentBridge>>,
}

impl ComponentRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a bridge, replacing any bridge with the same component id
    pub fn register(&mut self, bridge: impl ComponentBridge + 'static) -> &mut Self {
        self.register_arc(Arc::new(bridge))
    }

    /// Register an already shared bridge
    pub fn register_arc(&mut self, bridge: Arc<dyn ComponentBridge>) -> &mut Self {
        self.bridges.insert(bridge.component_id(), bridge);
        self
    }

    /// Builder-style registration
    pub fn with(mut self, bridge: impl ComponentBridge + 'static) -> Self {
        self.register(bridge);
        self
    }

    /// Bridge for a component id
    pub fn get(&self, component_id: ComponentId) -> Option<Arc<dyn ComponentBridge>> {
        self.bridges.get(&component_id).cloned()
    }

    pub fn contains(&self, component_id: ComponentId) -> bool {
        self.bridges.contains_key(&component_id)
    }

    pub fn len(&self) -> usize {
        self.bridges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bridges.is_empty()
    }

    /// Registered component ids in registration order
    pub fn component_ids(&self) -> impl Iterator<Item = ComponentId> + '_ {
        self.bridges.keys().copied()
    }
}
