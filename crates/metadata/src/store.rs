//! Combined metadata store trait.

use crate::error::MetadataResult;
use crate::postgres::PostgresStore;
use crate::repos::{
    DealRepo, EligibilityRepo, GlobalRepo, MatviewRepo, PieceRepo, ProposalRepo, ProviderRepo,
    ReservationRepo, TenantRepo,
};
use async_trait::async_trait;

/// Everything the web edge and cron jobs need from the store.
#[async_trait]
pub trait MetadataStore:
    TenantRepo
    + PieceRepo
    + ProviderRepo
    + ProposalRepo
    + DealRepo
    + EligibilityRepo
    + GlobalRepo
    + ReservationRepo
    + MatviewRepo
    + Send
    + Sync
{
    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;
}

#[async_trait]
impl MetadataStore for PostgresStore {
    async fn health_check(&self) -> MetadataResult<()> {
        PostgresStore::health_check(self).await
    }
}
