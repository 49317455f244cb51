//! Error types shared by every layer of the store.
//!
//! All fallible operations return [`EngineResult`]. Caller mistakes (duplicate
//! keys, missing records, points outside the spatial domain) are reported as
//! ordinary variants; storage failures surface as [`EngineError::Io`] and are
//! fatal only for the operation that hit them. The single process-level
//! failure is [`EngineError::RollbackFailed`], after which the store refuses
//! further work with [`EngineError::Poisoned`].

use std::io;
use thiserror::Error;

use crate::geometry::Point;
use crate::storage::BlockId;

/// Errors that can occur while operating the record store
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid block id {0}")]
    InvalidBlockId(BlockId),

    #[error("Format version mismatch in {file}: expected {expected}, found {found}")]
    FormatVersionMismatch {
        file: String,
        expected: u32,
        found: u32,
    },

    #[error("Corrupted file: {0}")]
    Corrupted(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Block {block} payload of {size} bytes exceeds the {limit} byte limit")]
    BlockOverflow { block: BlockId, size: usize, limit: usize },

    #[error("Record {key} does not fit into a storage slot: {reason}")]
    RecordTooLarge { key: u64, reason: String },

    #[error("Duplicate key {0}")]
    DuplicateKey(String),

    #[error("A record with identity {0} already exists")]
    DuplicateIdentity(u64),

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("No entry for record {key} at {point}")]
    PointNotFound { point: Point, key: u64 },

    #[error("Record {0} not found")]
    RecordNotFound(u64),

    #[error("Point {0} lies outside the indexed region")]
    OutOfBounds(Point),

    #[error("Rollback failed after '{cause}': {rollback}")]
    RollbackFailed {
        cause: Box<EngineError>,
        rollback: Box<EngineError>,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Store is closed")]
    Closed,

    #[error("Store is poisoned by an earlier failed rollback")]
    Poisoned,
}

/// Coarse classification of an [`EngineError`], handy for matching in callers
/// that do not care about the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Io,
    InvalidBlockId,
    FormatVersionMismatch,
    Corrupted,
    Serialization,
    BlockOverflow,
    RecordTooLarge,
    DuplicateKey,
    DuplicateIdentity,
    KeyNotFound,
    PointNotFound,
    RecordNotFound,
    OutOfBounds,
    RollbackFailed,
    InvalidConfig,
    Closed,
    Poisoned,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Io(_) => ErrorKind::Io,
            EngineError::InvalidBlockId(_) => ErrorKind::InvalidBlockId,
            EngineError::FormatVersionMismatch { .. } => ErrorKind::FormatVersionMismatch,
            EngineError::Corrupted(_) => ErrorKind::Corrupted,
            EngineError::Serialization(_) => ErrorKind::Serialization,
            EngineError::BlockOverflow { .. } => ErrorKind::BlockOverflow,
            EngineError::RecordTooLarge { .. } => ErrorKind::RecordTooLarge,
            EngineError::DuplicateKey(_) => ErrorKind::DuplicateKey,
            EngineError::DuplicateIdentity(_) => ErrorKind::DuplicateIdentity,
            EngineError::KeyNotFound(_) => ErrorKind::KeyNotFound,
            EngineError::PointNotFound { .. } => ErrorKind::PointNotFound,
            EngineError::RecordNotFound(_) => ErrorKind::RecordNotFound,
            EngineError::OutOfBounds(_) => ErrorKind::OutOfBounds,
            EngineError::RollbackFailed { .. } => ErrorKind::RollbackFailed,
            EngineError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            EngineError::Closed => ErrorKind::Closed,
            EngineError::Poisoned => ErrorKind::Poisoned,
        }
    }

    /// True for failures that leave the indices possibly out of step with
    /// each other.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::RollbackFailed { .. } | EngineError::Poisoned)
    }

    pub(crate) fn serialization(err: impl std::fmt::Display) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

/// Result type for store operations
pub type EngineResult<T> = Result<T, EngineError>;
