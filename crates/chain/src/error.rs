//! Chain oracle error types.

use thiserror::Error;

/// Errors from chain-node interaction and state decoding.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("rpc transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("block {0} not readable from chain node")]
    MissingBlock(cid::Cid),

    #[error("state decode error: {0}")]
    Decode(String),

    #[error("core error: {0}")]
    Core(#[from] stevedore_core::Error),
}

/// Result type for chain operations.
pub type ChainResult<T> = std::result::Result<T, ChainError>;
