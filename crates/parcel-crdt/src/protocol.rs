//! Last-write-wins CRDT protocol
//!
//! Keeps the replicated state of one scene and decides, for every incoming
//! message, whether it changes that state and what the change means for the
//! ECS world.
//!
//! # State
//!
//! - **Deleted entities**: entity number → highest deleted version. An entity
//!   number is reused by the scene with a bigger version, so only the number
//!   is stored.
//! - **LWW components**: component → entity → `{timestamp, payload}`. An empty
//!   payload is a tombstone left by a delete-component message.
//! - **Append components**: component → entity → values sorted by
//!   `(timestamp, payload)`. Grow-only, capped at
//!   [`MAX_APPEND_COMPONENTS_COUNT`] values per pair.
//!
//! # Conflict resolution
//!
//! For LWW components a message wins if its timestamp is strictly greater than
//! the stored one. Equal timestamps fall back to [`compare_data`] so every peer
//! converges on the same value regardless of delivery order.

use crate::message::compare_data;
use crate::reconciliation::{
    ReconciliationEffect, ReconciliationResult, StateReconciliationResult,
};
use crate::{ComponentId, CrdtEntity, CrdtMessage, CrdtMessageType, Error, Payload, Result};
use indexmap::map::Entry;
use indexmap::IndexMap;
use std::cmp::Ordering;

/// Values kept per `(entity, component)` for append components
pub const MAX_APPEND_COMPONENTS_COUNT: usize = 100;

/// Stored value of a component
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityComponentData {
    /// Timestamp of the message that produced the value
    pub timestamp: u32,
    /// Encoded value, empty for a deleted component
    pub payload: Payload,
}

impl EntityComponentData {
    fn new(timestamp: u32, payload: Payload) -> Self {
        Self { timestamp, payload }
    }

    /// Whether the value is a deletion tombstone
    pub fn is_deleted(&self) -> bool {
        self.payload.is_empty()
    }

    fn cmp_timestamp_then_data(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| compare_data(&self.payload, &other.payload))
    }
}

/// CRDT state of a single scene
#[derive(Debug, Default)]
pub struct CrdtProtocol {
    deleted_entities: IndexMap<u16, u16>,
    lww_components: IndexMap<ComponentId, IndexMap<CrdtEntity, EntityComponentData>>,
    append_components: IndexMap<ComponentId, IndexMap<CrdtEntity, Vec<EntityComponentData>>>,
    messages_count: usize,
}

impl CrdtProtocol {
    /// Create an empty protocol state
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages required to represent the current state
    pub fn messages_count(&self) -> usize {
        self.messages_count
    }

    /// Reconcile an incoming message against the stored state
    pub fn process_message(&mut self, message: &CrdtMessage) -> Result<ReconciliationResult> {
        let entity = message.entity;
        let number = entity.number();
        let version = entity.version();

        let deleted_version = self.deleted_entities.get(&number).copied();

        if deleted_version.is_some_and(|deleted| deleted >= version) {
            return Ok(ReconciliationResult::new(
                StateReconciliationResult::EntityWasDeleted,
                ReconciliationEffect::NoChanges,
            ));
        }

        match message.message_type {
            CrdtMessageType::DeleteEntity => {
                self.delete_entity(entity, deleted_version.is_some());
                Ok(ReconciliationResult::new(
                    StateReconciliationResult::EntityDeleted,
                    ReconciliationEffect::EntityDeleted,
                ))
            }
            CrdtMessageType::AppendComponent => {
                let result = if self.try_append_component(message) {
                    ReconciliationResult::new(
                        StateReconciliationResult::StateAppendedData,
                        ReconciliationEffect::ComponentAdded,
                    )
                } else {
                    ReconciliationResult::new(
                        StateReconciliationResult::NoChanges,
                        ReconciliationEffect::NoChanges,
                    )
                };
                Ok(result)
            }
            CrdtMessageType::PutComponent | CrdtMessageType::DeleteComponent => {
                Ok(self.update_lww_state(message))
            }
            CrdtMessageType::None => Err(Error::UnsupportedMessageType(
                CrdtMessageType::None as u32,
            )),
        }
    }

    /// Store a locally produced LWW message without computing an effect
    ///
    /// The local producer already guarantees the message is the final state of
    /// its key, so the result is irrelevant to the caller.
    pub fn enforce_lww_state(&mut self, message: &CrdtMessage) {
        self.update_lww_state(message);
    }

    /// Create a put message that supersedes the stored value and store it
    pub fn create_put_message(
        &mut self,
        entity: CrdtEntity,
        component_id: ComponentId,
        payload: impl Into<Payload>,
    ) -> CrdtMessage {
        let timestamp = self.next_timestamp(entity, component_id);
        let message = CrdtMessage::put(entity, component_id, timestamp, payload);
        self.update_lww_state(&message);
        message
    }

    /// Create a delete message that supersedes the stored value and store it
    pub fn create_delete_message(
        &mut self,
        entity: CrdtEntity,
        component_id: ComponentId,
    ) -> CrdtMessage {
        let timestamp = self.next_timestamp(entity, component_id);
        let message = CrdtMessage::delete_component(entity, component_id, timestamp);
        self.update_lww_state(&message);
        message
    }

    /// Create an append message
    ///
    /// Append messages produced locally are not kept in the state.
    pub fn create_append_message(
        &self,
        entity: CrdtEntity,
        component_id: ComponentId,
        timestamp: u32,
        payload: impl Into<Payload>,
    ) -> CrdtMessage {
        CrdtMessage::append(entity, component_id, timestamp, payload)
    }

    /// LWW values stored for an entity, for debugging
    pub fn state_for_entity(&self, entity: CrdtEntity) -> Vec<(ComponentId, EntityComponentData)> {
        self.lww_components
            .iter()
            .filter_map(|(component_id, inner)| {
                inner.get(&entity).map(|data| (*component_id, data.clone()))
            })
            .collect()
    }

    /// Stored LWW value of a key
    pub fn lww_value(
        &self,
        entity: CrdtEntity,
        component_id: ComponentId,
    ) -> Option<&EntityComponentData> {
        self.lww_components
            .get(&component_id)
            .and_then(|inner| inner.get(&entity))
    }

    /// Stored append values of a key, sorted by timestamp
    pub fn append_values(
        &self,
        entity: CrdtEntity,
        component_id: ComponentId,
    ) -> &[EntityComponentData] {
        self.append_components
            .get(&component_id)
            .and_then(|inner| inner.get(&entity))
            .map(|values| values.as_slice())
            .unwrap_or(&[])
    }

    /// Whether an entity number was deleted at the given version or later
    pub fn is_entity_deleted(&self, entity: CrdtEntity) -> bool {
        self.deleted_entities
            .get(&entity.number())
            .is_some_and(|deleted| *deleted >= entity.version())
    }

    /// Messages that reproduce the current state on another peer
    ///
    /// The result holds exactly [`messages_count`](Self::messages_count) messages.
    pub fn messages_from_current_state(&self) -> Vec<CrdtMessage> {
        let mut messages = Vec::with_capacity(self.messages_count);

        for (number, version) in &self.deleted_entities {
            messages.push(CrdtMessage::delete_entity(CrdtEntity::new(*number, *version)));
        }

        for (component_id, inner) in &self.lww_components {
            for (entity, data) in inner {
                let message = if data.is_deleted() {
                    CrdtMessage::delete_component(*entity, *component_id, data.timestamp)
                } else {
                    CrdtMessage::put(*entity, *component_id, data.timestamp, data.payload.clone())
                };
                messages.push(message);
            }
        }

        for (component_id, inner) in &self.append_components {
            for (entity, values) in inner {
                for data in values {
                    messages.push(CrdtMessage::append(
                        *entity,
                        *component_id,
                        data.timestamp,
                        data.payload.clone(),
                    ));
                }
            }
        }

        messages
    }

    /// Drop the whole state
    pub fn clear(&mut self) {
        self.deleted_entities.clear();
        self.lww_components.clear();
        self.append_components.clear();
        self.messages_count = 0;
    }

    fn next_timestamp(&self, entity: CrdtEntity, component_id: ComponentId) -> u32 {
        self.lww_value(entity, component_id)
            .map(|data| data.timestamp.wrapping_add(1))
            .unwrap_or(0)
    }

    fn update_lww_state(&mut self, message: &CrdtMessage) -> ReconciliationResult {
        let incoming = EntityComponentData::new(message.timestamp, message.payload.clone());
        let inner = self.lww_components.entry(message.component_id).or_default();

        let stored = match inner.entry(message.entity) {
            Entry::Occupied(occupied) => occupied.into_mut(),
            Entry::Vacant(vacant) => {
                vacant.insert(incoming);
                self.messages_count += 1;

                return ReconciliationResult::new(
                    StateReconciliationResult::StateUpdatedTimestamp,
                    lww_effect(false, message.message_type),
                );
            }
        };

        let existed = !stored.is_deleted();

        match stored.timestamp.cmp(&message.timestamp) {
            Ordering::Less => {
                *stored = incoming;
                ReconciliationResult::new(
                    StateReconciliationResult::StateUpdatedTimestamp,
                    lww_effect(existed, message.message_type),
                )
            }
            // Outdated, the client state will be resent
            Ordering::Greater => ReconciliationResult::new(
                StateReconciliationResult::StateOutdatedTimestamp,
                ReconciliationEffect::NoChanges,
            ),
            Ordering::Equal => match compare_data(&stored.payload, &message.payload) {
                Ordering::Equal => ReconciliationResult::new(
                    StateReconciliationResult::NoChanges,
                    ReconciliationEffect::NoChanges,
                ),
                Ordering::Greater => ReconciliationResult::new(
                    StateReconciliationResult::StateOutdatedData,
                    ReconciliationEffect::NoChanges,
                ),
                Ordering::Less => {
                    *stored = incoming;
                    ReconciliationResult::new(
                        StateReconciliationResult::StateUpdatedData,
                        lww_effect(existed, message.message_type),
                    )
                }
            },
        }
    }

    fn delete_entity(&mut self, entity: CrdtEntity, number_was_deleted: bool) {
        self.deleted_entities
            .insert(entity.number(), entity.version());

        if !number_was_deleted {
            self.messages_count += 1;
        }

        for inner in self.lww_components.values_mut() {
            if inner.shift_remove(&entity).is_some() {
                self.messages_count -= 1;
            }
        }

        for inner in self.append_components.values_mut() {
            if let Some(values) = inner.shift_remove(&entity) {
                self.messages_count -= values.len();
            }
        }
    }

    fn try_append_component(&mut self, message: &CrdtMessage) -> bool {
        let incoming = EntityComponentData::new(message.timestamp, message.payload.clone());
        let values = self
            .append_components
            .entry(message.component_id)
            .or_default()
            .entry(message.entity)
            .or_default();

        let position = match values.binary_search_by(|probe| probe.cmp_timestamp_then_data(&incoming)) {
            // The exact value is already known
            Ok(_) => return false,
            Err(position) => position,
        };

        if values.len() >= MAX_APPEND_COMPONENTS_COUNT {
            // clearing is cheaper than removing a range
            self.messages_count -= values.len();
            values.clear();
            values.push(incoming);
        } else {
            values.insert(position, incoming);
        }

        self.messages_count += 1;
        true
    }
}

/// Effect of an accepted LWW message
fn lww_effect(existed: bool, message_type: CrdtMessageType) -> ReconciliationEffect {
    match (message_type, existed) {
        (CrdtMessageType::DeleteComponent, true) => ReconciliationEffect::ComponentDeleted,
        (CrdtMessageType::DeleteComponent, false) => ReconciliationEffect::NoChanges,
        (_, true) => ReconciliationEffect::ComponentModified,
        (_, false) => ReconciliationEffect::ComponentAdded,
    }
}
