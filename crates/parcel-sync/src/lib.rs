//! Parcel Sync - CRDT to ECS world synchronization
//!
//! This crate turns the stream of CRDT messages a scene produces into batched,
//! atomic mutations of an ECS world.
//!
//! ## Architecture
//!
//! ```text
//! SceneCrdtBridge
//!  │
//!  ├── CrdtProtocol (parcel-crdt) ← decides the effect of every message
//!  │
//!  └── CrdtWorldSynchronizer ← one batch at a time (BinarySemaphore)
//!       │
//!       ├── WorldSyncCommandBuffer ← stages the batch, merges per key
//!       │    ├── BatchStatePool
//!       │    └── WorldSyncCommandBufferCollectionsPool
//!       │
//!       └── SceneWorld (world + CRDT entity map) ← CommandBuffer playback
//! ```
//!
//! ## Key Components
//!
//! - [`SceneCrdtBridge`]: Scene-level entry point owning the CRDT state
//! - [`CrdtWorldSynchronizer`]: Single-writer orchestrator of one scene world
//! - [`WorldSyncCommandBuffer`]: One batch, from staging to application
//! - [`EcsWorld`]: The world seam, with [`MemoryWorld`] as in-memory implementation
//! - [`ComponentBridge`]: Decodes payloads of one component id
//!
//! ## Design Principles
//!
//! 1. **parcel-crdt is standalone** - it does NOT know about worlds or pools
//! 2. **One writer per scene** - the world is only written while the permit is held
//! 3. **Decode once** - only the final value of a key in a batch is deserialized

mod batch_state;
mod collections_pool;
pub mod command;
mod component;
pub mod config;
mod error;
mod scene;
mod semaphore;
mod sync_buffer;
mod synchronizer;
pub mod world;

pub use batch_state::{BatchState, BatchStatePool};
pub use collections_pool::{ComponentStates, StagingMap, WorldSyncCommandBufferCollectionsPool};
pub use command::{CommandBuffer, PlaybackStats, WorldCommand};
pub use component::{BincodeBridge, ComponentBridge, ComponentRegistry, RawBridge, Utf8Bridge};
pub use config::SyncConfig;
pub use error::{Error, Result};
pub use scene::SceneCrdtBridge;
pub use semaphore::{BinarySemaphore, PauseSignal, SyncPermit};
pub use sync_buffer::{ApplyReport, WorldSyncCommandBuffer};
pub use synchronizer::CrdtWorldSynchronizer;
pub use world::{
    ComponentValue, DefaultEntityFactory, EcsWorld, EntityFactory, EntityMap, MemoryWorld,
    SceneWorld, WorldEntity,
};

pub use parcel_crdt::{
    ComponentId, CrdtEntity, CrdtMessage, CrdtMessageType, Payload, ReconciliationEffect,
    ReconciliationState,
};
