//! Per-scene world synchronizer
//!
//! [`CrdtWorldSynchronizer`] hands out one [`WorldSyncCommandBuffer`] at a time
//! and applies it to the scene world. The buffer carries the scene's write
//! permit, so only one batch can be staged or applied at once:
//!
//! ```text
//! Idle ──get_sync_command_buffer──▶ Staging ──apply_sync_command_buffer──▶ Idle
//! ```
//!
//! The world and the CRDT entity map are shared behind an `RwLock` and are
//! only written while the permit is held.

use crate::batch_state::BatchStatePool;
use crate::collections_pool::WorldSyncCommandBufferCollectionsPool;
use crate::command::CommandBuffer;
use crate::component::ComponentRegistry;
use crate::config::SyncConfig;
use crate::semaphore::{BinarySemaphore, PauseSignal};
use crate::sync_buffer::{ApplyReport, WorldSyncCommandBuffer};
use crate::world::{EcsWorld, EntityFactory, SceneWorld};
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Single-writer bridge between staged CRDT batches and one scene world
pub struct CrdtWorldSynchronizer<W: EcsWorld, F: EntityFactory<W>> {
    scene: Arc<RwLock<SceneWorld<W>>>,
    registry: Arc<ComponentRegistry>,
    factory: F,
    config: SyncConfig,
    batch_states: Arc<BatchStatePool>,
    collections: Arc<WorldSyncCommandBufferCollectionsPool>,
    semaphore: BinarySemaphore,
    pause: PauseSignal,
    command_buffer: Mutex<CommandBuffer<W::Entity>>,
    disposed: AtomicBool,
}

impl<W: EcsWorld, F: EntityFactory<W>> CrdtWorldSynchronizer<W, F> {
    /// Create a synchronizer for a scene
    ///
    /// `batch_states` may be shared between scenes; the collections pool is
    /// created per synchronizer.
    pub fn new(
        scene: Arc<RwLock<SceneWorld<W>>>,
        registry: Arc<ComponentRegistry>,
        factory: F,
        config: SyncConfig,
        batch_states: Arc<BatchStatePool>,
    ) -> Self {
        let collections = Arc::new(WorldSyncCommandBufferCollectionsPool::from_config(&config));
        let semaphore = BinarySemaphore::new().with_poll_interval(config.pause_poll_interval());
        let command_buffer = Mutex::new(CommandBuffer::with_capacity(
            config.command_buffer_capacity(),
        ));

        Self {
            scene,
            registry,
            factory,
            config,
            batch_states,
            collections,
            semaphore,
            pause: PauseSignal::new(),
            command_buffer,
            disposed: AtomicBool::new(false),
        }
    }

    /// Rent the command buffer for the next batch
    ///
    /// Blocks until the previous batch is applied or dropped, for at most the
    /// configured timeout. Paused time does not count against the timeout.
    pub fn get_sync_command_buffer(&self) -> Result<WorldSyncCommandBuffer> {
        if self.is_disposed() {
            return Err(Error::illegal_state("synchronizer is disposed"));
        }

        let started = Instant::now();
        let Some(permit) = self
            .semaphore
            .acquire_timeout(self.config.acquire_timeout(), &self.pause)
        else {
            let waited = started.elapsed();
            log::error!(
                "scene {}: sync command buffer not acquired after {}ms, skipping the cycle",
                self.config.scene_id(),
                waited.as_millis()
            );
            return Err(Error::Timeout {
                scene: self.config.scene_id().to_string(),
                waited,
            });
        };

        let mut buffer = WorldSyncCommandBuffer::new(
            Arc::clone(&self.collections),
            Arc::clone(&self.batch_states),
            Arc::clone(&self.registry),
        )?;
        buffer.attach_permit(permit);
        Ok(buffer)
    }

    /// Apply a rented buffer to the world and end the cycle
    ///
    /// Finalizes the buffer first if needed. After [`dispose`](Self::dispose)
    /// the buffer is discarded without touching the world and `None` is
    /// returned.
    pub fn apply_sync_command_buffer(
        &self,
        mut buffer: WorldSyncCommandBuffer,
    ) -> Result<Option<ApplyReport>> {
        if self.is_disposed() {
            log::debug!(
                "scene {}: synchronizer disposed, discarding in-flight buffer",
                self.config.scene_id()
            );
            buffer.dispose();
            return Ok(None);
        }

        if !buffer.is_finalized() {
            buffer.finalize_and_deserialize()?;
        }

        let report = {
            let mut scene = self.scene.write();
            // dispose may have won the race for the lock
            if self.is_disposed() {
                drop(scene);
                log::debug!(
                    "scene {}: synchronizer disposed, discarding in-flight buffer",
                    self.config.scene_id()
                );
                buffer.dispose();
                return Ok(None);
            }
            let (world, entities) = scene.parts_mut();
            let mut commands = self.command_buffer.lock();
            buffer.apply(
                world,
                &mut commands,
                entities,
                &self.factory,
                self.config.reserved_entities(),
            )?
        };

        drop(buffer);
        Ok(Some(report))
    }

    /// Tear the synchronizer down
    ///
    /// Clears the persistent command buffer and disposes the collections pool.
    /// A buffer staged concurrently is discarded when it is applied.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.command_buffer.lock().clear();
        self.collections.dispose();
        log::debug!("scene {}: synchronizer disposed", self.config.scene_id());
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Signal that suspends the acquire timeout while set
    pub fn pause_signal(&self) -> PauseSignal {
        self.pause.clone()
    }

    /// The shared scene world
    pub fn scene(&self) -> &Arc<RwLock<SceneWorld<W>>> {
        &self.scene
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.registry
    }

    pub fn collections_pool(&self) -> &Arc<WorldSyncCommandBufferCollectionsPool> {
        &self.collections
    }
}

impl<W: EcsWorld, F: EntityFactory<W>> std::fmt::Debug for CrdtWorldSynchronizer<W, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrdtWorldSynchronizer")
            .field("scene", &self.config.scene_id())
            .field("disposed", &self.is_disposed())
            .field("idle", &self.semaphore.is_available())
            .finish()
    }
}
