//! Repository traits for broker store operations.

pub mod deals;
pub mod eligibility;
pub mod global;
pub mod matviews;
pub mod pieces;
pub mod proposals;
pub mod providers;
pub mod reservations;
pub mod tenants;

pub use deals::{DealRepo, DealUpsert, ReconcileOutcome, ReconcileUpdate};
pub use eligibility::EligibilityRepo;
pub use global::GlobalRepo;
pub use matviews::MatviewRepo;
pub use pieces::{AggregateIngest, PieceRepo, SegmentIngest};
pub use proposals::ProposalRepo;
pub use providers::ProviderRepo;
pub use reservations::ReservationRepo;
pub use tenants::TenantRepo;
