//! Deferred world mutations
//!
//! Instead of mutating the world while a batch is walked, the command buffer
//! collects [`WorldCommand`]s into a [`CommandBuffer`] and plays them back in
//! one pass. The buffer is persistent: it lives as long as the synchronizer
//! and keeps its allocation between batches.

use crate::config::DEFAULT_COMMAND_BUFFER_CAPACITY;
use crate::world::{ComponentValue, EcsWorld};
use parcel_crdt::ComponentId;
use std::fmt;

/// A pending world mutation
pub enum WorldCommand<E> {
    /// Add a component or replace its value
    AddOrSetComponent {
        /// The entity to modify
        entity: E,
        /// The component to write
        component_id: ComponentId,
        /// The decoded value
        value: ComponentValue,
    },

    /// Remove a component
    RemoveComponent {
        /// The entity to modify
        entity: E,
        /// The component to remove
        component_id: ComponentId,
    },

    /// Destroy an entity and all its components
    DestroyEntity {
        /// The entity to destroy
        entity: E,
    },
}

impl<E: fmt::Debug> fmt::Debug for WorldCommand<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorldCommand::AddOrSetComponent {
                entity,
                component_id,
                ..
            } => f
                .debug_struct("AddOrSetComponent")
                .field("entity", entity)
                .field("component_id", component_id)
                .finish_non_exhaustive(),
            WorldCommand::RemoveComponent {
                entity,
                component_id,
            } => f
                .debug_struct("RemoveComponent")
                .field("entity", entity)
                .field("component_id", component_id)
                .finish(),
            WorldCommand::DestroyEntity { entity } => f
                .debug_struct("DestroyEntity")
                .field("entity", entity)
                .finish(),
        }
    }
}

/// Outcome of one playback
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackStats {
    /// Components added or replaced
    pub set: usize,
    /// Components removed
    pub removed: usize,
    /// Entities destroyed
    pub destroyed: usize,
    /// Commands whose target no longer existed
    pub skipped: usize,
}

impl PlaybackStats {
    /// Total number of commands that changed the world
    pub fn applied(&self) -> usize {
        self.set + self.removed + self.destroyed
    }
}

/// Reusable list of pending world mutations
pub struct CommandBuffer<E> {
    commands: Vec<WorldCommand<E>>,
}

impl<E> CommandBuffer<E> {
    /// Create a buffer with the default capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_COMMAND_BUFFER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            commands: Vec::with_capacity(capacity),
        }
    }

    /// Queue a command
    pub fn push(&mut self, command: WorldCommand<E>) {
        self.commands.push(command);
    }

    /// Queue a component write
    pub fn add_or_set_component(&mut self, entity: E, component_id: ComponentId, value: ComponentValue) {
        self.push(WorldCommand::AddOrSetComponent {
            entity,
            component_id,
            value,
        });
    }

    /// Queue a component removal
    pub fn remove_component(&mut self, entity: E, component_id: ComponentId) {
        self.push(WorldCommand::RemoveComponent {
            entity,
            component_id,
        });
    }

    /// Queue an entity destruction
    pub fn destroy_entity(&mut self, entity: E) {
        self.push(WorldCommand::DestroyEntity { entity });
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.commands.capacity()
    }

    /// Get an iterator over the queued commands
    pub fn iter(&self) -> impl Iterator<Item = &WorldCommand<E>> {
        self.commands.iter()
    }

    /// Drop every queued command, keeping the allocation
    pub fn clear(&mut self) {
        self.commands.clear();
    }

    /// Apply every queued command in order and empty the buffer
    ///
    /// Commands targeting entities that are no longer alive are skipped.
    pub fn playback<W>(&mut self, world: &mut W) -> PlaybackStats
    where
        W: EcsWorld<Entity = E>,
    {
        let mut stats = PlaybackStats::default();

        for command in self.commands.drain(..) {
            match command {
                WorldCommand::AddOrSetComponent {
                    entity,
                    component_id,
                    value,
                } => {
                    if world.add_or_set_component(entity, component_id, value) {
                        stats.set += 1;
                    } else {
                        stats.skipped += 1;
                    }
                }

                WorldCommand::RemoveComponent {
                    entity,
                    component_id,
                } => {
                    if world.remove_component(entity, component_id) {
                        stats.removed += 1;
                    } else {
                        stats.skipped += 1;
                    }
                }

                WorldCommand::DestroyEntity { entity } => {
                    if world.destroy_entity(entity) {
                        stats.destroyed += 1;
                    } else {
                        stats.skipped += 1;
                    }
                }
            }
        }

        stats
    }
}

impl<E> Default for CommandBuffer<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: fmt::Debug> fmt::Debug for CommandBuffer<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.commands.iter()).finish()
    }
}
