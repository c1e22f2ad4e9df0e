//! Error types shared across the crate.
//!
//! Absent data is never an error: point lookups return `Option` and a
//! revision conflict is reported in-band as `Ok(false)`. The variants here
//! cover the failures that actually abort an operation.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, SepalError>;

/// Errors produced by the database and its derived components.
#[derive(Error, Debug)]
pub enum SepalError {
    /// Failure reported by the underlying key-value engine.
    #[error("engine error: {0}")]
    Engine(String),

    /// The database could not be opened or created.
    #[error("failed to open database: {0}")]
    Open(String),

    /// All 255 keyspace slots are allocated.
    #[error("too many keyspaces: all 255 slots are allocated")]
    TooManyKeyspaces,

    /// The keyspace is soft-locked by a live component and cannot be freed.
    #[error("keyspace {0} is locked by a live component")]
    KeyspaceLocked(u8),

    /// A write was attempted against a read-only snapshot.
    #[error("write rejected: snapshot is read-only")]
    SnapshotWriteRejected,

    /// A stored key or value failed to decode. Indicates corruption.
    #[error("corrupted record: {0}")]
    Decode(String),
}

impl SepalError {
    /// Create an [`SepalError::Engine`] from any displayable message.
    pub fn engine(msg: impl Into<String>) -> Self {
        SepalError::Engine(msg.into())
    }

    /// Create an [`SepalError::Open`] from any displayable message.
    pub fn open(msg: impl Into<String>) -> Self {
        SepalError::Open(msg.into())
    }

    /// Create an [`SepalError::Decode`] from any displayable message.
    pub fn decode(msg: impl Into<String>) -> Self {
        SepalError::Decode(msg.into())
    }
}
