//! Error types for parcel-sync
//!
//! Programmer errors (illegal reuse of pooled collections, applying a buffer
//! twice) are returned immediately and never absorbed. Expected runtime races
//! (obsolete timestamps, missing entities, applying after disposal) are not
//! errors: they show up in [`ReconciliationEffect`](parcel_crdt::ReconciliationEffect)s
//! and [`ApplyReport`](crate::ApplyReport)s instead.

use parcel_crdt::ComponentId;
use std::time::Duration;
use thiserror::Error;

/// Result type for parcel-sync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in parcel-sync
#[derive(Debug, Error)]
pub enum Error {
    /// The write semaphore could not be acquired in time
    ///
    /// Signals a stuck writer or severe contention. The synchronization cycle
    /// is skipped.
    #[error("scene {scene}: sync command buffer not acquired after {}ms", .waited.as_millis())]
    Timeout {
        /// Scene the synchronizer belongs to
        scene: String,
        /// How long the caller waited
        waited: Duration,
    },

    /// A pooled resource was used in a way its ownership rules forbid
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// A batch state was released to a pool that did not lease it
    #[error("batch state released to a pool that did not lease it")]
    IllegalRelease,

    /// No bridge is registered for the component
    #[error("component {0} is not registered")]
    UnknownComponent(ComponentId),

    /// A payload could not be turned into a component value
    #[error("failed to deserialize {component}: {reason}")]
    Deserialization {
        /// Component the payload belongs to
        component: ComponentId,
        /// Decoder message
        reason: String,
    },

    /// Configuration could not be parsed or is invalid
    #[error("invalid configuration: {0}")]
    Config(String),

    /// CRDT protocol error
    #[error("crdt error: {0}")]
    Crdt(#[from] parcel_crdt::Error),
}

impl Error {
    /// Create an IllegalState error
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Error::IllegalState(message.into())
    }

    /// Whether the error is a semaphore timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}

// Compile-time check that Error is Send + Sync for thread-safe error propagation.
// This function is never called but will fail to compile if the bound is not satisfied.
fn _assert_error_send_sync<T: Send + Sync>() {}
fn _error_is_send_sync() {
    _assert_error_send_sync::<Error>();
}
