//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid piece cid: {0}")]
    InvalidPieceCid(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("piece size {size} is not a power of two")]
    SizeNotPowerOfTwo { size: u64 },

    #[error("piece log2 size {0} outside supported range")]
    Log2SizeOutOfRange(u8),

    #[error("segments do not fit into a {size}-byte aggregate: {detail}")]
    SegmentOverflow { size: u64, detail: String },

    #[error("aggregate commitment mismatch: expected {expected}, recomputed {actual}")]
    AggregateMismatch { expected: String, actual: String },

    #[error("unknown deal label kind")]
    UnknownLabelKind,

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
