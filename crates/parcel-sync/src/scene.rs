//! Scene-level CRDT driver
//!
//! [`SceneCrdtBridge`] is what a scene runtime talks to: it owns the scene's
//! [`CrdtProtocol`] and its [`CrdtWorldSynchronizer`], runs every incoming
//! message through the protocol and forwards the resulting effects to the
//! world in one batch.

use crate::sync_buffer::ApplyReport;
use crate::synchronizer::CrdtWorldSynchronizer;
use crate::world::{EcsWorld, EntityFactory};
use crate::Result;
use parcel_crdt::{CrdtMessage, CrdtProtocol};
use parking_lot::Mutex;

/// CRDT state and world synchronization of one scene
pub struct SceneCrdtBridge<W: EcsWorld, F: EntityFactory<W>> {
    protocol: Mutex<CrdtProtocol>,
    synchronizer: CrdtWorldSynchronizer<W, F>,
}

impl<W: EcsWorld, F: EntityFactory<W>> SceneCrdtBridge<W, F> {
    pub fn new(synchronizer: CrdtWorldSynchronizer<W, F>) -> Self {
        Self {
            protocol: Mutex::new(CrdtProtocol::new()),
            synchronizer,
        }
    }

    /// Reconcile a batch from the scene runtime and apply it to the world
    ///
    /// Returns `None` once the scene is disposed. Messages the protocol or the
    /// buffer rejects are logged and skipped, the rest of the batch applies.
    pub fn send_to_renderer<I>(&self, messages: I) -> Result<Option<ApplyReport>>
    where
        I: IntoIterator<Item = CrdtMessage>,
    {
        if self.synchronizer.is_disposed() {
            return Ok(None);
        }

        let mut buffer = self.synchronizer.get_sync_command_buffer()?;
        {
            let mut protocol = self.protocol.lock();
            for message in messages {
                let entity = message.entity;
                let staged = protocol
                    .process_message(&message)
                    .map_err(Into::into)
                    .and_then(|result| buffer.sync_message(message, result.effect));
                if let Err(e) = staged {
                    log::warn!(
                        "scene {}: {} skipped: {}",
                        self.synchronizer.config().scene_id(),
                        entity,
                        e
                    );
                }
            }
        }
        buffer.finalize_and_deserialize()?;

        self.synchronizer.apply_sync_command_buffer(buffer)
    }

    /// Record messages produced on the client side
    ///
    /// Only last-write-wins messages are enforced; the scene receives the
    /// others through its own channel.
    pub fn enforce_outgoing<'a, I>(&self, messages: I)
    where
        I: IntoIterator<Item = &'a CrdtMessage>,
    {
        let mut protocol = self.protocol.lock();
        for message in messages {
            if message.message_type.is_lww() {
                protocol.enforce_lww_state(message);
            }
        }
    }

    /// The full CRDT state as messages, for scenes that (re)start
    pub fn get_state(&self) -> Vec<CrdtMessage> {
        self.protocol.lock().messages_from_current_state()
    }

    /// Number of messages the CRDT state holds
    pub fn messages_count(&self) -> usize {
        self.protocol.lock().messages_count()
    }

    /// Run a closure against the CRDT state
    pub fn with_protocol<R>(&self, f: impl FnOnce(&mut CrdtProtocol) -> R) -> R {
        f(&mut self.protocol.lock())
    }

    pub fn synchronizer(&self) -> &CrdtWorldSynchronizer<W, F> {
        &self.synchronizer
    }

    /// Dispose the synchronizer and drop the CRDT state
    pub fn dispose(&self) {
        self.synchronizer.dispose();
        self.protocol.lock().clear();
    }
}
