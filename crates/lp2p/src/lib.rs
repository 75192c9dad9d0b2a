//! Deal-proposal delivery over libp2p.
//!
//! The delivery stage talks to each storage provider's market node with a
//! single framed CBOR request/response exchange per proposal. One
//! [`DealClient`] (one libp2p host) serves a whole cron run; connections are
//! per-provider and explicitly closed between proposals.

pub mod client;
pub mod error;
pub mod wire;

pub use client::{AddrInfo, DealClient};
pub use error::{Lp2pError, Lp2pResult};
pub use wire::{StorageProposalV120Params, StorageProposalV120Response, STORAGE_PROPOSAL_V120};

// Re-exported so callers handling attested peer info don't need their own
// libp2p dependency.
pub use libp2p::{Multiaddr, PeerId};
