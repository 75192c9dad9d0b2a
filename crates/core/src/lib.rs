//! Domain primitives shared across the stevedore workspace.
//!
//! Everything in here is deliberately free of I/O: piece commitments and
//! their CID forms, the aggregation arithmetic used to verify tenant-supplied
//! manifests, chain addresses and epochs, the deal-proposal wire payload with
//! its canonical CBOR form, and the public API types served by the web edge.

pub mod address;
pub mod api;
pub mod deal;
pub mod epoch;
pub mod error;
pub mod frc58;
pub mod meta;
pub mod piece;

pub use address::{ActorId, Address};
pub use error::{Error, Result};
pub use piece::{CommP, PieceInfo};

/// Default number of entries returned by the eligible-pieces listing.
pub const LIST_ELIGIBLE_DEFAULT_SIZE: u64 = 500;

/// Hard cap on the eligible-pieces listing `limit` parameter.
pub const LIST_ELIGIBLE_MAX_SIZE: u64 = 10_000;

/// Provider chain-info older than this is considered stale and the provider
/// is not served deals until `poll-providers` refreshes it.
pub const SP_INFO_STALE_AFTER_MINUTES: i64 = 15;

/// Default chain lookback, in epochs, used to dodge reorg churn.
pub const DEFAULT_LOOKBACK_EPOCHS: u64 = 10;

/// Epochs between reservation acceptance and the earliest permitted deal
/// start: enough horizon for signing, delivery and seal scheduling.
pub const DEAL_START_DELAY_EPOCHS: i64 = 3 * epoch::EPOCHS_IN_DAY;

/// Default deal duration when the tenant policy does not override it.
pub const DEFAULT_DEAL_DURATION_DAYS: i64 = 530;
