//! Parcel CRDT - Scene state replication model
//!
//! This crate provides the leaf types shared by every producer and consumer of
//! scene state:
//! - Entity and component identifiers (`CrdtEntity`, `ComponentId`)
//! - Immutable CRDT messages with opaque payloads (`CrdtMessage`, `Payload`)
//! - Reconciliation effects and the first/last state used to merge a batch
//! - A last-write-wins CRDT protocol that turns incoming messages into effects
//!
//! ## Flow
//!
//! ```text
//! scene runtime ──► CrdtMessage ──► CrdtProtocol::process_message
//!                                        │
//!                                        └──► ReconciliationEffect ──► parcel-sync
//! ```
//!
//! `parcel-crdt` knows nothing about the ECS world. Turning effects into world
//! mutations is the job of `parcel-sync`.

mod entity;
mod error;
mod message;
pub mod protocol;
pub mod reconciliation;

pub use entity::{ComponentId, CrdtEntity};
pub use error::{Error, Result};
pub use message::{compare_data, CrdtMessage, CrdtMessageType, Payload};
pub use protocol::{CrdtProtocol, EntityComponentData, MAX_APPEND_COMPONENTS_COUNT};
pub use reconciliation::{
    ReconciliationEffect, ReconciliationResult, ReconciliationState, StateReconciliationResult,
};
