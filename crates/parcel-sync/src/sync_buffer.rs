//! Batched world synchronization
//!
//! A [`WorldSyncCommandBuffer`] merges the messages of one batch down to the
//! final state of every `(entity, component)` key, decodes each surviving
//! value exactly once and applies the result to the world in one pass.
//!
//! # Lifecycle
//!
//! ```text
//! Staging ──finalize_and_deserialize──▶ Finalized ──apply──▶ Disposed
//!    │                                                          ▲
//!    └────────────────────────── dispose / drop ────────────────┘
//! ```
//!
//! Staging may run on a worker thread. `apply` runs on the thread that owns
//! the world, under the scene's write semaphore.

use crate::batch_state::{BatchState, BatchStatePool};
use crate::collections_pool::{StagingMap, WorldSyncCommandBufferCollectionsPool};
use crate::command::CommandBuffer;
use crate::component::ComponentRegistry;
use crate::semaphore::SyncPermit;
use crate::world::{EcsWorld, EntityFactory, EntityMap};
use crate::{Error, Result};
use parcel_crdt::{
    compare_data, ComponentId, CrdtEntity, CrdtMessage, CrdtMessageType, Payload,
    ReconciliationEffect, ReconciliationState,
};
use std::cmp::Ordering;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Staging,
    Finalized,
    Disposed,
}

/// What one applied batch did to the world
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// World entities created for CRDT entities seen for the first time
    pub created: usize,
    /// Components added or replaced
    pub updated: usize,
    /// Components removed
    pub removed: usize,
    /// Entities destroyed
    pub destroyed: usize,
    /// Mutations whose target entity or component did not exist
    pub missing: usize,
    /// Keys reconciled to [`ReconciliationEffect::Missing`], in staging order
    pub missing_keys: Vec<(CrdtEntity, ComponentId)>,
    /// Keys and deletions ignored because they target reserved entities
    pub skipped_reserved: usize,
}

impl ApplyReport {
    /// Whether the batch changed the world
    pub fn has_changes(&self) -> bool {
        self.created + self.updated + self.removed + self.destroyed > 0
    }
}

/// Stages one batch of reconciled CRDT messages
///
/// Owns the rented staging collections of its scene until it is applied or
/// disposed. Holding a buffer rented from a synchronizer also holds the
/// scene's write permit.
pub struct WorldSyncCommandBuffer {
    main: Option<StagingMap>,
    deleted: Option<Vec<CrdtEntity>>,
    collections: Arc<WorldSyncCommandBufferCollectionsPool>,
    batch_states: Arc<BatchStatePool>,
    registry: Arc<ComponentRegistry>,
    permit: Option<SyncPermit>,
    phase: Phase,
}

impl WorldSyncCommandBuffer {
    /// Rent the staging collections of a scene
    ///
    /// Fails with [`Error::IllegalState`] if another buffer of the same scene
    /// still holds them.
    pub fn new(
        collections: Arc<WorldSyncCommandBufferCollectionsPool>,
        batch_states: Arc<BatchStatePool>,
        registry: Arc<ComponentRegistry>,
    ) -> Result<Self> {
        let main = collections.get_main_dictionary()?;
        let deleted = match collections.get_deleted_entities() {
            Ok(deleted) => deleted,
            Err(e) => {
                collections.release_main_dictionary(main)?;
                return Err(e);
            }
        };

        Ok(Self {
            main: Some(main),
            deleted: Some(deleted),
            collections,
            batch_states,
            registry,
            permit: None,
            phase: Phase::Staging,
        })
    }

    pub(crate) fn attach_permit(&mut self, permit: SyncPermit) {
        self.permit = Some(permit);
    }

    /// Stage a message with the effect the CRDT protocol reported for it
    ///
    /// Returns the effect recorded for the message's key:
    /// - `EntityDeleted` queues the entity for destruction and drops its
    ///   staged components;
    /// - a component effect for an unregistered component is `NoChanges`;
    /// - a component message that loses to the staged one, by timestamp then
    ///   by payload, is `Obsolete`;
    /// - `NoChanges`, `Obsolete` and `Missing` stage nothing.
    pub fn sync_message(
        &mut self,
        message: CrdtMessage,
        effect: ReconciliationEffect,
    ) -> Result<ReconciliationEffect> {
        self.ensure_staging()?;

        match effect {
            ReconciliationEffect::EntityDeleted => {
                self.stage_entity_deletion(message.entity)?;
                Ok(ReconciliationEffect::EntityDeleted)
            }
            effect if effect.is_applied() => self.stage_component(message, effect),
            other => Ok(other),
        }
    }

    /// Stage a message without a protocol result
    ///
    /// The effect is derived from the message type alone.
    pub fn stage(&mut self, message: CrdtMessage) -> Result<ReconciliationEffect> {
        let effect = match message.message_type {
            CrdtMessageType::PutComponent | CrdtMessageType::AppendComponent => {
                ReconciliationEffect::ComponentModified
            }
            CrdtMessageType::DeleteComponent => ReconciliationEffect::ComponentDeleted,
            CrdtMessageType::DeleteEntity => ReconciliationEffect::EntityDeleted,
            CrdtMessageType::None => {
                return Err(parcel_crdt::Error::UnsupportedMessageType(0).into());
            }
        };
        self.sync_message(message, effect)
    }

    fn stage_entity_deletion(&mut self, entity: CrdtEntity) -> Result<()> {
        let (Some(main), Some(deleted)) = (self.main.as_mut(), self.deleted.as_mut()) else {
            return Err(Error::illegal_state("command buffer is disposed"));
        };

        if !deleted.contains(&entity) {
            deleted.push(entity);
        }

        // the entity can't revive, anything staged for it is void
        if let Some(mut states) = main.shift_remove(&entity) {
            for (_, state) in states.drain(..) {
                self.batch_states.release(state)?;
            }
            self.collections.release_inner_dictionary(states);
        }
        Ok(())
    }

    fn stage_component(
        &mut self,
        message: CrdtMessage,
        effect: ReconciliationEffect,
    ) -> Result<ReconciliationEffect> {
        let Some(bridge) = self.registry.get(message.component_id) else {
            log::warn!(
                "scene {}: {} is not registered, message for {} dropped",
                self.collections.scene_id(),
                message.component_id,
                message.entity
            );
            return Ok(ReconciliationEffect::NoChanges);
        };

        let main = self
            .main
            .as_mut()
            .ok_or_else(|| Error::illegal_state("command buffer is disposed"))?;
        let collections = &self.collections;
        let batch_states = &self.batch_states;

        let states = main
            .entry(message.entity)
            .or_insert_with(|| collections.get_inner_dictionary());
        let state = states
            .entry(message.component_id)
            .or_insert_with(|| batch_states.acquire());

        if let Some(staged) = state.message() {
            let order = message
                .timestamp
                .cmp(&staged.timestamp)
                .then_with(|| compare_data(&message.payload, &staged.payload));
            if order != Ordering::Greater {
                log::trace!(
                    "scene {}: {} {} ts {} obsolete (staged ts {})",
                    collections.scene_id(),
                    message.entity,
                    message.component_id,
                    message.timestamp,
                    staged.timestamp
                );
                return Ok(ReconciliationEffect::Obsolete);
            }
        }

        if state.bridge().is_none() {
            state.set_bridge(bridge);
        }
        state.update(message, effect);
        Ok(effect)
    }

    /// Last effect staged for a key
    pub fn last_state(
        &self,
        entity: CrdtEntity,
        component_id: ComponentId,
    ) -> Option<ReconciliationEffect> {
        self.reconciliation_state(entity, component_id)
            .map(|state| state.last)
    }

    /// First and last effect staged for a key
    pub fn reconciliation_state(
        &self,
        entity: CrdtEntity,
        component_id: ComponentId,
    ) -> Option<ReconciliationState> {
        self.main
            .as_ref()?
            .get(&entity)?
            .get(&component_id)?
            .reconciliation()
    }

    /// Payload of the latest accepted message for a key
    pub fn staged_payload(&self, entity: CrdtEntity, component_id: ComponentId) -> Option<&Payload> {
        self.main
            .as_ref()?
            .get(&entity)?
            .get(&component_id)?
            .message()
            .map(|message| &message.payload)
    }

    /// Entities queued for destruction
    pub fn deleted_entities(&self) -> &[CrdtEntity] {
        self.deleted.as_deref().unwrap_or(&[])
    }

    /// Number of staged `(entity, component)` keys
    pub fn staged_len(&self) -> usize {
        self.main
            .as_ref()
            .map(|main| main.values().map(|states| states.len()).sum())
            .unwrap_or(0)
    }

    pub fn is_finalized(&self) -> bool {
        self.phase == Phase::Finalized
    }

    pub fn is_disposed(&self) -> bool {
        self.phase == Phase::Disposed
    }

    /// Resolve every key through the merge matrix and decode surviving values
    ///
    /// Only the final payload of a key is decoded. Keys that resolve to no
    /// change, and keys whose payload fails to decode, are dropped from the
    /// batch. Entities left without keys are dropped too.
    pub fn finalize_and_deserialize(&mut self) -> Result<()> {
        self.ensure_staging()?;

        let main = self
            .main
            .as_mut()
            .ok_or_else(|| Error::illegal_state("command buffer is disposed"))?;
        let scene_id = self.collections.scene_id();

        let mut entity_index = 0;
        while let Some((_, states)) = main.get_index_mut(entity_index) {
            let mut index = 0;
            while let Some((_, state)) = states.get_index_mut(index) {
                let resolved = state
                    .reconciliation()
                    .map(|reconciliation| reconciliation.resolve())
                    .unwrap_or_default();
                state.set_reconciliation(ReconciliationState::single(resolved));

                let keep = if resolved.is_upsert() {
                    let decoded = match (state.bridge(), state.message()) {
                        (Some(bridge), Some(message)) => bridge.deserialize(&message.payload),
                        _ => Err(Error::illegal_state("staged state without message")),
                    };
                    match decoded {
                        Ok(value) => {
                            state.set_deserialization_target(value);
                            true
                        }
                        Err(e) => {
                            log::warn!("scene {}: {}", scene_id, e);
                            false
                        }
                    }
                } else {
                    resolved == ReconciliationEffect::ComponentDeleted
                };

                if keep {
                    index += 1;
                } else if let Some((_, state)) = states.shift_remove_index(index) {
                    self.batch_states.release(state)?;
                }
            }

            if states.is_empty() {
                if let Some((_, states)) = main.shift_remove_index(entity_index) {
                    self.collections.release_inner_dictionary(states);
                }
            } else {
                entity_index += 1;
            }
        }

        self.phase = Phase::Finalized;
        Ok(())
    }

    /// Apply the finalized batch to the world
    ///
    /// Deleted entities are destroyed and unmapped first. World entities are
    /// created through `factory` for CRDT entities not yet in `entities`;
    /// component writes and removals are queued into `command_buffer` and
    /// played back in one pass. Entities listed in `reserved` are never
    /// touched. The buffer is disposed afterwards.
    pub fn apply<W, F>(
        &mut self,
        world: &mut W,
        command_buffer: &mut CommandBuffer<W::Entity>,
        entities: &mut EntityMap<W::Entity>,
        factory: &F,
        reserved: &[CrdtEntity],
    ) -> Result<ApplyReport>
    where
        W: EcsWorld,
        F: EntityFactory<W> + ?Sized,
    {
        match self.phase {
            Phase::Finalized => {}
            Phase::Staging => {
                return Err(Error::illegal_state(
                    "finalize_and_deserialize must be called before apply",
                ))
            }
            Phase::Disposed => return Err(Error::illegal_state("command buffer is disposed")),
        }

        let (Some(main), Some(deleted)) = (self.main.as_mut(), self.deleted.as_ref()) else {
            return Err(Error::illegal_state("command buffer is disposed"));
        };
        let scene_id = self.collections.scene_id();
        let mut report = ApplyReport::default();

        for crdt_entity in deleted {
            if reserved.contains(crdt_entity) {
                report.skipped_reserved += 1;
                continue;
            }
            match entities.remove(crdt_entity) {
                Some(entity) => command_buffer.destroy_entity(entity),
                None => {
                    log::debug!("scene {}: deleted {} was never instantiated", scene_id, crdt_entity);
                }
            }
        }

        for (crdt_entity, states) in main.iter_mut() {
            if reserved.contains(crdt_entity) {
                report.skipped_reserved += states.len();
                continue;
            }

            let mut entity = entities.get(crdt_entity).copied();

            for (component_id, state) in states.iter_mut() {
                let effect = state
                    .reconciliation()
                    .map(|reconciliation| reconciliation.last)
                    .unwrap_or_default();

                match effect {
                    ReconciliationEffect::ComponentAdded | ReconciliationEffect::ComponentModified => {
                        let Some(value) = state.take_deserialization_target() else {
                            continue;
                        };
                        let target = match entity {
                            Some(target) if world.contains(target) => target,
                            Some(_) => {
                                log::debug!(
                                    "scene {}: {} of {} targets a dead entity",
                                    scene_id,
                                    component_id,
                                    crdt_entity
                                );
                                record_missing(&mut report, state, *crdt_entity, *component_id);
                                continue;
                            }
                            None => {
                                let created = factory.create(*crdt_entity, world);
                                entities.insert(*crdt_entity, created);
                                report.created += 1;
                                entity = Some(created);
                                created
                            }
                        };
                        command_buffer.add_or_set_component(target, *component_id, value);
                    }
                    ReconciliationEffect::ComponentDeleted => match entity {
                        Some(target) if world.has_component(target, *component_id) => {
                            command_buffer.remove_component(target, *component_id)
                        }
                        _ => {
                            log::debug!(
                                "scene {}: {} of {} removed but not present",
                                scene_id,
                                component_id,
                                crdt_entity
                            );
                            record_missing(&mut report, state, *crdt_entity, *component_id);
                        }
                    },
                    _ => {}
                }
            }
        }

        let stats = command_buffer.playback(world);
        report.updated = stats.set;
        report.removed = stats.removed;
        report.destroyed = stats.destroyed;
        report.missing += stats.skipped;

        log::debug!(
            "scene {}: applied batch, {} created, {} updated, {} removed, {} destroyed, {} missing",
            scene_id,
            report.created,
            report.updated,
            report.removed,
            report.destroyed,
            report.missing
        );

        self.release_collections();
        Ok(report)
    }

    /// Return every staged state and collection to their pools
    ///
    /// Also releases the write permit if the buffer holds one. Calling it again
    /// does nothing.
    pub fn dispose(&mut self) {
        self.release_collections();
        self.permit = None;
    }

    fn release_collections(&mut self) {
        let scene_id = self.collections.scene_id();

        if let Some(mut main) = self.main.take() {
            for (_, mut states) in main.drain(..) {
                for (_, state) in states.drain(..) {
                    if let Err(e) = self.batch_states.release(state) {
                        log::error!("scene {}: {}", scene_id, e);
                    }
                }
                self.collections.release_inner_dictionary(states);
            }
            if let Err(e) = self.collections.release_main_dictionary(main) {
                log::error!("scene {}: {}", scene_id, e);
            }
        }

        if let Some(deleted) = self.deleted.take() {
            if let Err(e) = self.collections.release_deleted_entities(deleted) {
                log::error!("scene {}: {}", scene_id, e);
            }
        }

        self.phase = Phase::Disposed;
    }

    fn ensure_staging(&self) -> Result<()> {
        match self.phase {
            Phase::Staging => Ok(()),
            Phase::Finalized => Err(Error::illegal_state(
                "command buffer is finalized and can't be modified",
            )),
            Phase::Disposed => Err(Error::illegal_state("command buffer is disposed")),
        }
    }
}

fn record_missing(
    report: &mut ApplyReport,
    state: &mut BatchState,
    crdt_entity: CrdtEntity,
    component_id: ComponentId,
) {
    state.set_reconciliation(ReconciliationState::reconcile(
        state.reconciliation(),
        ReconciliationEffect::Missing,
    ));
    report.missing += 1;
    report.missing_keys.push((crdt_entity, component_id));
}

impl Drop for WorldSyncCommandBuffer {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for WorldSyncCommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorldSyncCommandBuffer")
            .field("scene", &self.collections.scene_id())
            .field("phase", &self.phase)
            .field("staged", &self.staged_len())
            .field("deleted", &self.deleted_entities())
            .field("holds_permit", &self.permit.is_some())
            .finish()
    }
}
