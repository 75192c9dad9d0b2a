//! SP-facing web API.
//!
//! Authentication happens upstream; this layer consumes the authenticated
//! actor id, enforces request shape, and serves the eligibility listing,
//! pending-proposal views and the reservation call, all wrapped in the
//! standard response envelope.

pub mod auth;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

pub use routes::create_router;
pub use state::AppState;
