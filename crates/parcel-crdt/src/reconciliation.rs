//! Reconciliation effects and per-batch reconciliation state
//!
//! A [`ReconciliationEffect`] describes what processing one message means for
//! the ECS representation of an `(entity, component)` pair. Within a batch the
//! same pair can be touched many times; [`ReconciliationState`] keeps the first
//! and the last effect, and [`ReconciliationState::resolve`] collapses them into
//! the single mutation that has to reach the world.
//!
//! # Merge matrix
//!
//! | first \ last        | Added     | Modified  | Deleted   |
//! |---------------------|-----------|-----------|-----------|
//! | `ComponentAdded`    | Added     | Added     | NoChanges |
//! | `ComponentModified` | Modified  | Modified  | Deleted   |
//! | `ComponentDeleted`  | Modified  | Modified  | Deleted   |
//!
//! If the component did not exist before the batch (`first == Added`) it must
//! be added unless the batch also removed it. If it existed, the last effect
//! decides between an update and a removal.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of processing one message for the world representation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ReconciliationEffect {
    /// Nothing to do
    #[default]
    NoChanges,
    /// The component did not exist and must be added
    ComponentAdded,
    /// The component existed and its value changed
    ComponentModified,
    /// The component must be removed
    ComponentDeleted,
    /// The entity and all of its components must be destroyed
    EntityDeleted,
    /// The message did not advance the timestamp of its key and was discarded
    Obsolete,
    /// The mutation targets an entity that does not exist in the world
    Missing,
}

impl ReconciliationEffect {
    /// Whether the effect carries a component mutation
    pub fn is_applied(&self) -> bool {
        matches!(
            self,
            ReconciliationEffect::ComponentAdded
                | ReconciliationEffect::ComponentModified
                | ReconciliationEffect::ComponentDeleted
        )
    }

    /// Whether the component value must be (re)written to the world
    pub fn is_upsert(&self) -> bool {
        matches!(
            self,
            ReconciliationEffect::ComponentAdded | ReconciliationEffect::ComponentModified
        )
    }
}

impl fmt::Display for ReconciliationEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReconciliationEffect::NoChanges => "no-changes",
            ReconciliationEffect::ComponentAdded => "component-added",
            ReconciliationEffect::ComponentModified => "component-modified",
            ReconciliationEffect::ComponentDeleted => "component-deleted",
            ReconciliationEffect::EntityDeleted => "entity-deleted",
            ReconciliationEffect::Obsolete => "obsolete",
            ReconciliationEffect::Missing => "missing",
        };
        f.write_str(name)
    }
}

/// First and last effect observed for a key within one batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct ReconciliationState {
    /// Effect of the first message that touched the key
    pub first: ReconciliationEffect,
    /// Effect of the most recent message that touched the key
    pub last: ReconciliationEffect,
}

impl ReconciliationState {
    /// Create a state from both effects
    pub fn new(first: ReconciliationEffect, last: ReconciliationEffect) -> Self {
        Self { first, last }
    }

    /// A state where the key was touched exactly once
    pub fn single(effect: ReconciliationEffect) -> Self {
        Self::new(effect, effect)
    }

    /// Fold an incoming effect into the current state
    ///
    /// An absent state starts with `first == last == incoming`; otherwise `first`
    /// is preserved and `last` is overwritten.
    pub fn reconcile(current: Option<Self>, incoming: ReconciliationEffect) -> Self {
        match current {
            None => Self::single(incoming),
            Some(state) => Self::new(state.first, incoming),
        }
    }

    /// Collapse the pair into the single effect that reaches the world
    pub fn resolve(&self) -> ReconciliationEffect {
        use ReconciliationEffect::*;

        match (self.first, self.last) {
            (ComponentAdded, ComponentAdded | ComponentModified) => ComponentAdded,
            (ComponentAdded, ComponentDeleted) => NoChanges,
            (ComponentModified | ComponentDeleted, ComponentAdded | ComponentModified) => {
                ComponentModified
            }
            (ComponentModified | ComponentDeleted, ComponentDeleted) => ComponentDeleted,
            (_, last) if last.is_applied() => last,
            _ => NoChanges,
        }
    }

    /// Whether the resolved state requires any world mutation
    pub fn has_changes(&self) -> bool {
        self.resolve() != ReconciliationEffect::NoChanges
    }
}

/// How the CRDT state itself reacted to a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateReconciliationResult {
    /// The message matched the stored state exactly
    NoChanges,
    /// The message carried a newer timestamp and replaced the stored value
    StateUpdatedTimestamp,
    /// The message carried an older timestamp and was ignored
    StateOutdatedTimestamp,
    /// Same timestamp, the stored payload wins the tie
    StateOutdatedData,
    /// Same timestamp, the incoming payload wins the tie
    StateUpdatedData,
    /// The entity was deleted by this message
    EntityDeleted,
    /// The entity had already been deleted, the message was ignored
    EntityWasDeleted,
    /// A new value was appended to a grow-only component
    StateAppendedData,
}

/// Result of processing one message through the CRDT protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReconciliationResult {
    /// What happened to the CRDT state
    pub state: StateReconciliationResult,
    /// What has to happen to the world
    pub effect: ReconciliationEffect,
}

impl ReconciliationResult {
    /// Create a new result
    pub fn new(state: StateReconciliationResult, effect: ReconciliationEffect) -> Self {
        Self { state, effect }
    }
}
