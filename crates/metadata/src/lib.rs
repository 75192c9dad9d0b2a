//! PostgreSQL store: the single shared mutable state of the broker.
//!
//! The transactional discipline here is the system's only lock. Readers lean
//! on materialized views refreshed at the end of reconcile/ingest runs; live
//! proposal state is always queried directly so reservations committed
//! between refreshes are visible immediately.

pub mod error;
pub mod models;
pub mod postgres;
pub mod repos;
pub mod store;

pub use error::{MetadataError, MetadataResult};
pub use postgres::PostgresStore;
pub use repos::reservations::{ReservationDenied, ReservationError, ReservationOutcome};
pub use store::MetadataStore;
