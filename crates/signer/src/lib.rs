//! Wallet signing for deal proposals.
//!
//! Key material lives in a local keystore directory, one file per robust
//! client address, in the standard hex-wrapped JSON export format. Signing
//! follows the chain convention: blake2b-256 digest of the payload, then a
//! recoverable secp256k1 ECDSA signature. Secret keys are never logged and
//! never leave this crate.

pub mod error;
pub mod key;
pub mod signer;

pub use error::{SignerError, SignerResult};
pub use key::{Keystore, SecretKey};
pub use signer::{verify_signature, WalletSigner};
