//! Signer error types.

use thiserror::Error;

/// Wallet signing errors.
#[derive(Debug, Error)]
pub enum SignerError {
    #[error("no key material for client {0}")]
    MissingKey(String),

    #[error("key parsing error: {0}")]
    KeyParsing(String),

    #[error("unsupported key type '{0}'")]
    UnsupportedKeyType(String),

    #[error("signing error: {0}")]
    Signing(String),

    #[error("signature verification failed")]
    VerificationFailed,

    #[error("keystore io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for signer operations.
pub type SignerResult<T> = std::result::Result<T, SignerError>;
