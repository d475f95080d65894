//! Pooled per-key batch scratch records
//!
//! A [`BatchState`] stages everything a command buffer knows about one
//! `(entity, component)` key during a batch: the latest message, the
//! reconciliation state, the bridge that decodes it and the decoded value.
//! States are leased from a [`BatchStatePool`] and returned cleared.

use crate::component::ComponentBridge;
use crate::config::SyncConfig;
use crate::world::ComponentValue;
use crate::{Error, Result};
use parcel_crdt::{CrdtMessage, ReconciliationEffect, ReconciliationState};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Scratch record for one `(entity, component)` key of a batch
#[derive(Default)]
pub struct BatchState {
    message: Option<CrdtMessage>,
    reconciliation: Option<ReconciliationState>,
    bridge: Option<Arc<dyn ComponentBridge>>,
    deserialization_target: Option<ComponentValue>,
    lease: Option<u64>,
}

impl BatchState {
    /// The latest accepted message for the key
    pub fn message(&self) -> Option<&CrdtMessage> {
        self.message.as_ref()
    }

    /// Timestamp of the latest accepted message
    pub fn timestamp(&self) -> Option<u32> {
        self.message.as_ref().map(|message| message.timestamp)
    }

    /// First and last effect seen in this batch, `None` if never touched
    pub fn reconciliation(&self) -> Option<ReconciliationState> {
        self.reconciliation
    }

    /// Bridge decoding the key's payload
    pub fn bridge(&self) -> Option<&Arc<dyn ComponentBridge>> {
        self.bridge.as_ref()
    }

    /// The decoded value waiting to be written to the world
    pub fn deserialization_target(&self) -> Option<&ComponentValue> {
        self.deserialization_target.as_ref()
    }

    /// Set the decoded value
    pub fn set_deserialization_target(&mut self, value: ComponentValue) {
        self.deserialization_target = Some(value);
    }

    /// Move the decoded value out
    pub fn take_deserialization_target(&mut self) -> Option<ComponentValue> {
        self.deserialization_target.take()
    }

    /// Accept a message and fold its effect into the reconciliation state
    ///
    /// A new payload invalidates any value decoded from the previous one.
    pub fn update(&mut self, message: CrdtMessage, effect: ReconciliationEffect) {
        self.reconciliation = Some(ReconciliationState::reconcile(self.reconciliation, effect));
        self.message = Some(message);
        self.deserialization_target = None;
    }

    pub(crate) fn set_reconciliation(&mut self, reconciliation: ReconciliationState) {
        self.reconciliation = Some(reconciliation);
    }

    pub(crate) fn set_bridge(&mut self, bridge: Arc<dyn ComponentBridge>) {
        self.bridge = Some(bridge);
    }

    /// Whether the state was leased by the pool with this id
    fn leased_by(&self, pool_id: u64) -> bool {
        self.lease == Some(pool_id)
    }

    fn clear(&mut self) {
        self.message = None;
        self.reconciliation = None;
        self.bridge = None;
        self.deserialization_target = None;
        self.lease = None;
    }
}

impl fmt::Debug for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchState")
            .field("message", &self.message)
            .field("reconciliation", &self.reconciliation)
            .field("bridge", &self.bridge.as_ref().map(|b| b.component_id()))
            .field("decoded", &self.deserialization_target.is_some())
            .finish()
    }
}

/// Thread-safe free list of [`BatchState`]s
///
/// `acquire` never blocks on anything but the free-list lock and allocates
/// only when the list is empty. At most `max_retained` states are kept.
#[derive(Debug)]
pub struct BatchStatePool {
    id: u64,
    free: Mutex<Vec<BatchState>>,
    leased: AtomicUsize,
    max_retained: usize,
    collection_check: bool,
}

impl BatchStatePool {
    /// Create a pool
    pub fn new(max_retained: usize, collection_check: bool) -> Self {
        Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            free: Mutex::new(Vec::new()),
            leased: AtomicUsize::new(0),
            max_retained,
            collection_check,
        }
    }

    /// Create a pool sized by the configuration
    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.batch_state_pool_max(), config.collection_check())
    }

    /// Lease a cleared state
    pub fn acquire(&self) -> BatchState {
        let mut state = self.free.lock().pop().unwrap_or_default();
        state.lease = Some(self.id);
        self.leased.fetch_add(1, Ordering::Relaxed);
        state
    }

    /// Clear a state and return it to the free list
    ///
    /// With collection checking enabled, a state this pool did not lease is
    /// rejected with [`Error::IllegalRelease`] and dropped.
    pub fn release(&self, mut state: BatchState) -> Result<()> {
        if self.collection_check && !state.leased_by(self.id) {
            return Err(Error::IllegalRelease);
        }

        state.clear();
        let _ = self
            .leased
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));

        let mut free = self.free.lock();
        if free.len() < self.max_retained {
            free.push(state);
        }
        Ok(())
    }

    /// Number of states waiting in the free list
    pub fn retained(&self) -> usize {
        self.free.lock().len()
    }

    /// Number of states currently leased
    pub fn leased(&self) -> usize {
        self.leased.load(Ordering::Relaxed)
    }

    pub fn collection_check(&self) -> bool {
        self.collection_check
    }
}

impl Default for BatchStatePool {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Utf8Bridge;
    use parcel_crdt::ReconciliationEffect::*;

    #[test]
    fn test_acquire_reuses_released_state() {
        let pool = BatchStatePool::new(8, true);
        let state = pool.acquire();
        assert_eq!(pool.leased(), 1);
        pool.release(state).unwrap();
        assert_eq!(pool.leased(), 0);
        assert_eq!(pool.retained(), 1);

        let state = pool.acquire();
        assert_eq!(pool.retained(), 0);
        assert!(state.message().is_none());
        assert!(state.reconciliation().is_none());
    }

    #[test]
    fn test_release_clears_deserialization_target() {
        let pool = BatchStatePool::new(8, true);
        let decoded = Arc::new("C".to_string());

        let mut state = pool.acquire();
        state.set_bridge(Arc::new(Utf8Bridge::new(10, "text")));
        state.update(CrdtMessage::put(1, 10, 3, "C"), ComponentAdded);
        state.set_deserialization_target(Box::new(Arc::clone(&decoded)));
        assert_eq!(Arc::strong_count(&decoded), 2);

        pool.release(state).unwrap();
        assert_eq!(Arc::strong_count(&decoded), 1);

        let state = pool.acquire();
        assert!(state.deserialization_target().is_none());
        assert!(state.bridge().is_none());
    }

    #[test]
    fn test_update_tracks_first_and_last() {
        let pool = BatchStatePool::new(8, false);
        let mut state = pool.acquire();
        state.update(CrdtMessage::put(1, 10, 1, "A"), ComponentAdded);
        state.set_deserialization_target(Box::new("A".to_string()));
        state.update(CrdtMessage::put(1, 10, 3, "C"), ComponentModified);

        assert_eq!(state.timestamp(), Some(3));
        assert_eq!(
            state.reconciliation(),
            Some(ReconciliationState::new(ComponentAdded, ComponentModified))
        );
        // stale decoded value is dropped with the old payload
        assert!(state.deserialization_target().is_none());
    }

    #[test]
    fn test_foreign_release_detected() {
        let pool_a = BatchStatePool::new(8, true);
        let pool_b = BatchStatePool::new(8, true);

        let state = pool_a.acquire();
        assert!(matches!(pool_b.release(state), Err(Error::IllegalRelease)));
        assert!(matches!(
            pool_b.release(BatchState::default()),
            Err(Error::IllegalRelease)
        ));
    }

    #[test]
    fn test_foreign_release_allowed_without_check() {
        let pool_a = BatchStatePool::new(8, false);
        let pool_b = BatchStatePool::new(8, false);
        let state = pool_a.acquire();
        assert!(pool_b.release(state).is_ok());
        assert_eq!(pool_b.retained(), 1);
    }

    #[test]
    fn test_retention_is_bounded() {
        let pool = BatchStatePool::new(2, true);
        let states: Vec<_> = (0..5).map(|_| pool.acquire()).collect();
        for state in states {
            pool.release(state).unwrap();
        }
        assert_eq!(pool.retained(), 2);
        assert_eq!(pool.leased(), 0);
    }
}
