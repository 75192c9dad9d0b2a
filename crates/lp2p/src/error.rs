//! Delivery transport errors.

use thiserror::Error;

/// Errors surfaced by the proposal delivery client.
#[derive(Debug, Error)]
pub enum Lp2pError {
    #[error("provider not dialable: {0}")]
    Undialable(String),

    #[error("rpc deadline exceeded")]
    DeadlineExceeded,

    #[error("rpc failure: {0}")]
    Rpc(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("transport setup error: {0}")]
    Setup(String),

    #[error("client event loop is gone")]
    ClientClosed,
}

impl Lp2pError {
    /// True when the failure was a timeout: the delivery stage treats this
    /// as "provider is bad today" and abandons its remaining queue.
    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, Lp2pError::DeadlineExceeded)
    }
}

/// Result type for delivery operations.
pub type Lp2pResult<T> = std::result::Result<T, Lp2pError>;
