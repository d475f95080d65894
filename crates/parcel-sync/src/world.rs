//! ECS world seam
//!
//! The synchronizer treats the ECS world as an opaque entity/component store.
//! [`EcsWorld`] is the whole surface it needs; [`MemoryWorld`] is an in-memory
//! implementation for tests and for embedders without their own ECS.
//!
//! [`SceneWorld`] bundles a world with the persistent `CrdtEntity → entity`
//! map. Both are only mutated by the holder of the scene's write semaphore.

use indexmap::IndexMap;
use parcel_crdt::{ComponentId, CrdtEntity};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

/// A type-erased component value
pub type ComponentValue = Box<dyn Any + Send + Sync>;

/// Persistent mapping from CRDT entities to world entities
pub type EntityMap<E> = HashMap<CrdtEntity, E>;

/// Opaque entity/component store the synchronizer writes to
pub trait EcsWorld {
    /// World entity handle
    type Entity: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static;

    /// Create an entity without components
    fn create_entity(&mut self) -> Self::Entity;

    /// Check if an entity is alive
    fn contains(&self, entity: Self::Entity) -> bool;

    /// Add a component or replace its value
    ///
    /// Returns `false` if the entity is not alive.
    fn add_or_set_component(
        &mut self,
        entity: Self::Entity,
        component_id: ComponentId,
        value: ComponentValue,
    ) -> bool;

    /// Remove a component, returns `false` if it was not present
    fn remove_component(&mut self, entity: Self::Entity, component_id: ComponentId) -> bool;

    /// Destroy an entity with all its components, returns `false` if it was not alive
    fn destroy_entity(&mut self, entity: Self::Entity) -> bool;

    /// Borrow a type-erased component
    fn component(
        &self,
        entity: Self::Entity,
        component_id: ComponentId,
    ) -> Option<&(dyn Any + Send + Sync)>;

    /// Borrow a component as a concrete type
    fn try_get_component<T: Any>(&self, entity: Self::Entity, component_id: ComponentId) -> Option<&T>
    where
        Self: Sized,
    {
        self.component(entity, component_id)
            .and_then(|value| value.downcast_ref::<T>())
    }

    /// Check if an entity has a component
    fn has_component(&self, entity: Self::Entity, component_id: ComponentId) -> bool {
        self.component(entity, component_id).is_some()
    }
}

/// Handle of an entity in a [`MemoryWorld`]
///
/// Slots are reused; the generation tells a stale handle from the live one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorldEntity {
    index: u32,
    generation: u32,
}

impl WorldEntity {
    /// Slot index
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Slot generation
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for WorldEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entity:{}#{}", self.index, self.generation)
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    alive: bool,
    components: IndexMap<ComponentId, ComponentValue>,
}

/// In-memory [`EcsWorld`]
#[derive(Debug, Default)]
pub struct MemoryWorld {
    slots: Vec<Slot>,
    free: Vec<u32>,
    alive: usize,
}

impl MemoryWorld {
    /// Create an empty world
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entities
    pub fn len(&self) -> usize {
        self.alive
    }

    /// Check if the world has no live entities
    pub fn is_empty(&self) -> bool {
        self.alive == 0
    }

    /// Number of components attached to an entity
    pub fn component_count(&self, entity: WorldEntity) -> usize {
        self.slot(entity)
            .map(|slot| slot.components.len())
            .unwrap_or(0)
    }

    /// Iterate over live entities
    pub fn entities(&self) -> impl Iterator<Item = WorldEntity> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.alive)
            .map(|(index, slot)| WorldEntity {
                index: index as u32,
                generation: slot.generation,
            })
    }

    fn slot(&self, entity: WorldEntity) -> Option<&Slot> {
        self.slots
            .get(entity.index as usize)
            .filter(|slot| slot.alive && slot.generation == entity.generation)
    }

    fn slot_mut(&mut self, entity: WorldEntity) -> Option<&mut Slot> {
        self.slots
            .get_mut(entity.index as usize)
            .filter(|slot| slot.alive && slot.generation == entity.generation)
    }
}

impl EcsWorld for MemoryWorld {
    type Entity = WorldEntity;

    fn create_entity(&mut self) -> WorldEntity {
        self.alive += 1;

        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.generation = slot.generation.wrapping_add(1);
            slot.alive = true;
            return WorldEntity {
                index,
                generation: slot.generation,
            };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            alive: true,
            components: IndexMap::new(),
        });
        WorldEntity {
            index,
            generation: 0,
        }
    }

    fn contains(&self, entity: WorldEntity) -> bool {
        self.slot(entity).is_some()
    }

    fn add_or_set_component(
        &mut self,
        entity: WorldEntity,
        component_id: ComponentId,
        value: ComponentValue,
    ) -> bool {
        match self.slot_mut(entity) {
            Some(slot) => {
                slot.components.insert(component_id, value);
                true
            }
            None => false,
        }
    }

    fn remove_component(&mut self, entity: WorldEntity, component_id: ComponentId) -> bool {
        self.slot_mut(entity)
            .is_some_and(|slot| slot.components.shift_remove(&component_id).is_some())
    }

    fn destroy_entity(&mut self, entity: WorldEntity) -> bool {
        let Some(slot) = self.slot_mut(entity) else {
            return false;
        };

        slot.alive = false;
        slot.components.clear();
        self.free.push(entity.index);
        self.alive -= 1;
        true
    }

    fn component(
        &self,
        entity: WorldEntity,
        component_id: ComponentId,
    ) -> Option<&(dyn Any + Send + Sync)> {
        self.slot(entity)
            .and_then(|slot| slot.components.get(&component_id))
            .map(|value| &**value)
    }
}

/// A world together with its persistent CRDT entity map
#[derive(Debug, Default)]
pub struct SceneWorld<W: EcsWorld> {
    world: W,
    entities: EntityMap<W::Entity>,
}

impl<W: EcsWorld> SceneWorld<W> {
    /// Wrap a world with an empty entity map
    pub fn new(world: W) -> Self {
        Self {
            world,
            entities: EntityMap::new(),
        }
    }

    /// Get a reference to the world
    pub fn world(&self) -> &W {
        &self.world
    }

    /// Get a mutable reference to the world
    pub fn world_mut(&mut self) -> &mut W {
        &mut self.world
    }

    /// Get the entity map
    pub fn entities(&self) -> &EntityMap<W::Entity> {
        &self.entities
    }

    /// Get the entity map mutably
    pub fn entities_mut(&mut self) -> &mut EntityMap<W::Entity> {
        &mut self.entities
    }

    /// World entity instantiated for a CRDT entity
    pub fn entity(&self, crdt_entity: CrdtEntity) -> Option<W::Entity> {
        self.entities.get(&crdt_entity).copied()
    }

    /// Borrow the world and the entity map at the same time
    pub fn parts_mut(&mut self) -> (&mut W, &mut EntityMap<W::Entity>) {
        (&mut self.world, &mut self.entities)
    }

    /// Borrow the component of a CRDT entity as a concrete type
    pub fn component<T: Any>(&self, crdt_entity: CrdtEntity, component_id: ComponentId) -> Option<&T>
    where
        W: Sized,
    {
        self.entity(crdt_entity)
            .and_then(|entity| self.world.try_get_component::<T>(entity, component_id))
    }
}

/// Creates the world entity backing a CRDT entity
pub trait EntityFactory<W: EcsWorld>: Send + Sync {
    /// Create the world entity for `crdt_entity`
    fn create(&self, crdt_entity: CrdtEntity, world: &mut W) -> W::Entity;
}

/// Factory that creates an empty entity
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultEntityFactory;

impl<W: EcsWorld> EntityFactory<W> for DefaultEntityFactory {
    fn create(&self, _crdt_entity: CrdtEntity, world: &mut W) -> W::Entity {
        world.create_entity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COMPONENT: ComponentId = ComponentId(10);

    #[test]
    fn test_memory_world_components() {
        let mut world = MemoryWorld::new();
        let entity = world.create_entity();

        assert!(world.add_or_set_component(entity, COMPONENT, Box::new("A".to_string())));
        assert_eq!(
            world.try_get_component::<String>(entity, COMPONENT),
            Some(&"A".to_string())
        );

        world.add_or_set_component(entity, COMPONENT, Box::new("C".to_string()));
        assert_eq!(
            world.try_get_component::<String>(entity, COMPONENT),
            Some(&"C".to_string())
        );
        assert_eq!(world.component_count(entity), 1);

        // wrong type
        assert!(world.try_get_component::<u32>(entity, COMPONENT).is_none());

        assert!(world.remove_component(entity, COMPONENT));
        assert!(!world.remove_component(entity, COMPONENT));
        assert!(!world.has_component(entity, COMPONENT));
    }

    #[test]
    fn test_memory_world_reuses_slots_with_new_generation() {
        let mut world = MemoryWorld::new();
        let first = world.create_entity();
        assert!(world.destroy_entity(first));
        assert!(!world.destroy_entity(first));

        let second = world.create_entity();
        assert_eq!(second.index(), first.index());
        assert_ne!(second.generation(), first.generation());
        assert!(!world.contains(first));
        assert!(world.contains(second));
        assert!(!world.add_or_set_component(first, COMPONENT, Box::new(1u32)));
        assert_eq!(world.len(), 1);
    }

    #[test]
    fn test_scene_world_lookup() {
        let mut scene = SceneWorld::new(MemoryWorld::new());
        let entity = DefaultEntityFactory.create(CrdtEntity(512), scene.world_mut());
        scene.entities_mut().insert(CrdtEntity(512), entity);
        scene
            .world_mut()
            .add_or_set_component(entity, COMPONENT, Box::new(7u32));

        assert_eq!(scene.entity(CrdtEntity(512)), Some(entity));
        assert_eq!(scene.component::<u32>(CrdtEntity(512), COMPONENT), Some(&7));
        assert!(scene.component::<u32>(CrdtEntity(513), COMPONENT).is_none());
    }
}
