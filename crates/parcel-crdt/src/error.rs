//! Error types for parcel-crdt

use thiserror::Error;

/// CRDT model error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Message type {0} is not supported")]
    UnsupportedMessageType(u32),

    #[error("Invalid entity: {0}")]
    InvalidEntity(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
