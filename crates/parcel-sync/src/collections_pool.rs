//! Per-scene pool of the collections a command buffer stages into
//!
//! One scene owns one pool. The main dictionary and the deleted-entities list
//! exist once per pool and can be rented by a single command buffer at a
//! time; renting twice is a programmer error. Inner dictionaries come from a
//! bounded free list.

use crate::batch_state::BatchState;
use crate::config::SyncConfig;
use crate::{Error, Result};
use indexmap::IndexMap;
use parcel_crdt::{ComponentId, CrdtEntity};
use parking_lot::Mutex;

/// Staged states of one entity, by component
pub type ComponentStates = IndexMap<ComponentId, BatchState>;

/// Staged states of a batch, by entity then component
pub type StagingMap = IndexMap<CrdtEntity, ComponentStates>;

#[derive(Debug)]
struct PoolSlots {
    /// `None` while rented
    main: Option<StagingMap>,
    /// `None` while rented
    deleted: Option<Vec<CrdtEntity>>,
    inner_free: Vec<ComponentStates>,
    inner_rented: usize,
    disposed: bool,
}

/// Lends the staging collections of one scene
#[derive(Debug)]
pub struct WorldSyncCommandBufferCollectionsPool {
    scene_id: String,
    max_inner: usize,
    slots: Mutex<PoolSlots>,
}

impl WorldSyncCommandBufferCollectionsPool {
    /// Create a pool retaining at most `max_inner` inner dictionaries
    pub fn new(scene_id: impl Into<String>, max_inner: usize) -> Self {
        Self {
            scene_id: scene_id.into(),
            max_inner,
            slots: Mutex::new(PoolSlots {
                main: Some(StagingMap::new()),
                deleted: Some(Vec::new()),
                inner_free: Vec::new(),
                inner_rented: 0,
                disposed: false,
            }),
        }
    }

    /// Create a pool sized by the configuration
    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.scene_id(), config.inner_dictionary_pool_max())
    }

    /// Scene the pool belongs to
    pub fn scene_id(&self) -> &str {
        &self.scene_id
    }

    /// Rent the main dictionary
    pub fn get_main_dictionary(&self) -> Result<StagingMap> {
        let mut slots = self.slots.lock();
        if slots.disposed {
            return Err(Error::illegal_state("collections pool is disposed"));
        }
        slots
            .main
            .take()
            .ok_or_else(|| Error::illegal_state("main dictionary is already rented"))
    }

    /// Return the main dictionary, keeping its capacity
    pub fn release_main_dictionary(&self, mut dictionary: StagingMap) -> Result<()> {
        let mut slots = self.slots.lock();
        if slots.disposed {
            return Ok(());
        }
        if slots.main.is_some() {
            return Err(Error::illegal_state("main dictionary is not rented"));
        }
        dictionary.clear();
        slots.main = Some(dictionary);
        Ok(())
    }

    /// Rent the deleted-entities list
    pub fn get_deleted_entities(&self) -> Result<Vec<CrdtEntity>> {
        let mut slots = self.slots.lock();
        if slots.disposed {
            return Err(Error::illegal_state("collections pool is disposed"));
        }
        slots
            .deleted
            .take()
            .ok_or_else(|| Error::illegal_state("deleted entities list is already rented"))
    }

    /// Return the deleted-entities list, keeping its capacity
    pub fn release_deleted_entities(&self, mut deleted: Vec<CrdtEntity>) -> Result<()> {
        let mut slots = self.slots.lock();
        if slots.disposed {
            return Ok(());
        }
        if slots.deleted.is_some() {
            return Err(Error::illegal_state("deleted entities list is not rented"));
        }
        deleted.clear();
        slots.deleted = Some(deleted);
        Ok(())
    }

    /// Take an empty inner dictionary, allocating if none is free
    pub fn get_inner_dictionary(&self) -> ComponentStates {
        let mut slots = self.slots.lock();
        slots.inner_rented += 1;
        slots.inner_free.pop().unwrap_or_default()
    }

    /// Return an inner dictionary
    ///
    /// The dictionary is dropped when the pool already retains its maximum.
    pub fn release_inner_dictionary(&self, mut dictionary: ComponentStates) {
        dictionary.clear();

        let mut slots = self.slots.lock();
        slots.inner_rented = slots.inner_rented.saturating_sub(1);
        if !slots.disposed && slots.inner_free.len() < self.max_inner {
            slots.inner_free.push(dictionary);
        }
    }

    /// Whether the main dictionary is currently rented
    pub fn is_main_dictionary_rented(&self) -> bool {
        self.slots.lock().main.is_none()
    }

    /// Whether the deleted-entities list is currently rented
    pub fn is_deleted_entities_rented(&self) -> bool {
        self.slots.lock().deleted.is_none()
    }

    /// Inner dictionaries waiting in the free list
    pub fn inner_retained(&self) -> usize {
        self.slots.lock().inner_free.len()
    }

    /// Inner dictionaries handed out and not yet returned
    pub fn inner_rented(&self) -> usize {
        self.slots.lock().inner_rented
    }

    pub fn is_disposed(&self) -> bool {
        self.slots.lock().disposed
    }

    /// Drop every pooled collection
    ///
    /// Collections still rented are reported and dropped by their holder.
    /// Later releases are accepted and discarded.
    pub fn dispose(&self) {
        let mut slots = self.slots.lock();
        if slots.disposed {
            return;
        }
        slots.disposed = true;

        if slots.main.is_none() {
            log::warn!(
                "scene {}: collections pool disposed while the main dictionary is rented",
                self.scene_id
            );
        }
        if slots.deleted.is_none() {
            log::warn!(
                "scene {}: collections pool disposed while the deleted entities list is rented",
                self.scene_id
            );
        }

        slots.main = None;
        slots.deleted = None;
        slots.inner_free = Vec::new();
    }
}
