//! Synchronizer configuration
//!
//! [`SyncConfig`] controls the write-semaphore timeout, pool sizes and which
//! CRDT entities are never instantiated in the world. It can be built in code
//! or loaded from RON:
//!
//! ```
//! use parcel_sync::SyncConfig;
//!
//! let config = SyncConfig::from_ron_str("(scene_id: \"-9,12\", acquire_timeout_ms: 250)").unwrap();
//! assert_eq!(config.scene_id(), "-9,12");
//! assert_eq!(config.acquire_timeout().as_millis(), 250);
//! // unspecified fields keep their defaults
//! assert_eq!(config.command_buffer_capacity(), 64);
//! ```

use crate::{Error, Result};
use parcel_crdt::CrdtEntity;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default bounded wait for the write semaphore
pub const DEFAULT_ACQUIRE_TIMEOUT_MS: u64 = 5000;

/// Default initial capacity of the persistent command buffer
pub const DEFAULT_COMMAND_BUFFER_CAPACITY: usize = 64;

/// Configuration of one scene synchronizer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Label used in logs and timeout errors
    scene_id: String,
    /// Bounded wait for the write semaphore, in milliseconds
    acquire_timeout_ms: u64,
    /// How often a paused acquire re-checks the pause signal, in milliseconds
    pause_poll_interval_ms: u64,
    /// Initial capacity of the persistent command buffer
    command_buffer_capacity: usize,
    /// Inner dictionaries retained by the collections pool
    inner_dictionary_pool_max: usize,
    /// Batch states retained by the batch state pool
    batch_state_pool_max: usize,
    /// Detect batch states released to the wrong pool
    collection_check: bool,
    /// CRDT entities that are never instantiated in the world
    reserved_entities: Vec<CrdtEntity>,
}

impl SyncConfig {
    /// Create a default configuration for a scene
    pub fn new(scene_id: impl Into<String>) -> Self {
        Self {
            scene_id: scene_id.into(),
            ..Self::default()
        }
    }

    /// Parse and validate a RON document
    pub fn from_ron_str(source: &str) -> Result<Self> {
        let config: SyncConfig =
            ron::from_str(source).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to a RON document
    pub fn to_ron_string(&self) -> Result<String> {
        ron::to_string(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Check the invariants the synchronizer relies on
    pub fn validate(&self) -> Result<()> {
        if self.acquire_timeout_ms == 0 {
            return Err(Error::Config("acquire_timeout_ms must be positive".into()));
        }
        if self.pause_poll_interval_ms == 0 {
            return Err(Error::Config(
                "pause_poll_interval_ms must be positive".into(),
            ));
        }
        if self.inner_dictionary_pool_max == 0 || self.batch_state_pool_max == 0 {
            return Err(Error::Config("pool sizes must be positive".into()));
        }
        Ok(())
    }

    /// Set the bounded wait for the write semaphore
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout_ms = timeout.as_millis().max(1) as u64;
        self
    }

    /// Set the initial capacity of the persistent command buffer
    pub fn with_command_buffer_capacity(mut self, capacity: usize) -> Self {
        self.command_buffer_capacity = capacity;
        self
    }

    /// Set the number of inner dictionaries the collections pool retains
    pub fn with_inner_dictionary_pool_max(mut self, max: usize) -> Self {
        self.inner_dictionary_pool_max = max.max(1);
        self
    }

    /// Set the number of batch states the batch state pool retains
    pub fn with_batch_state_pool_max(mut self, max: usize) -> Self {
        self.batch_state_pool_max = max.max(1);
        self
    }

    /// Enable or disable foreign-release detection
    pub fn with_collection_check(mut self, enabled: bool) -> Self {
        self.collection_check = enabled;
        self
    }

    /// Add an entity the synchronizer never instantiates
    pub fn with_reserved_entity(mut self, entity: CrdtEntity) -> Self {
        if !self.reserved_entities.contains(&entity) {
            self.reserved_entities.push(entity);
        }
        self
    }

    /// Scene label
    pub fn scene_id(&self) -> &str {
        &self.scene_id
    }

    /// Bounded wait for the write semaphore
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// Poll interval while paused
    pub fn pause_poll_interval(&self) -> Duration {
        Duration::from_millis(self.pause_poll_interval_ms)
    }

    /// Initial capacity of the persistent command buffer
    pub fn command_buffer_capacity(&self) -> usize {
        self.command_buffer_capacity
    }

    /// Inner dictionaries retained by the collections pool
    pub fn inner_dictionary_pool_max(&self) -> usize {
        self.inner_dictionary_pool_max
    }

    /// Batch states retained by the batch state pool
    pub fn batch_state_pool_max(&self) -> usize {
        self.batch_state_pool_max
    }

    /// Whether foreign-release detection is enabled
    pub fn collection_check(&self) -> bool {
        self.collection_check
    }

    /// Entities that are never instantiated
    pub fn reserved_entities(&self) -> &[CrdtEntity] {
        &self.reserved_entities
    }

    /// Check if an entity is reserved
    pub fn is_reserved(&self, entity: CrdtEntity) -> bool {
        self.reserved_entities.contains(&entity)
    }
}

impl Default for SyncConfig {
    /// Collection checks follow `debug_assertions`: on in debug and test builds,
    /// off on the release hot path.
    fn default() -> Self {
        Self {
            scene_id: "scene".to_string(),
            acquire_timeout_ms: DEFAULT_ACQUIRE_TIMEOUT_MS,
            pause_poll_interval_ms: 10,
            command_buffer_capacity: DEFAULT_COMMAND_BUFFER_CAPACITY,
            inner_dictionary_pool_max: 1024,
            batch_state_pool_max: 4096,
            collection_check: cfg!(debug_assertions),
            reserved_entities: Vec::new(),
        }
    }
}
