//! Tenant and client repository.

use crate::error::MetadataResult;
use crate::models::{ClientRow, TenantRow};
use crate::postgres::PostgresStore;
use async_trait::async_trait;

#[async_trait]
pub trait TenantRepo: Send + Sync {
    async fn list_tenants(&self) -> MetadataResult<Vec<TenantRow>>;

    async fn tenant(&self, tenant_id: i16) -> MetadataResult<Option<TenantRow>>;

    /// Resolve the tenant whose policy descriptor the SP supplied.
    async fn tenant_by_policy(&self, policy_cid: &str) -> MetadataResult<Option<TenantRow>>;

    /// All clients belonging to some tenant; the set the reconciler tracks
    /// datacap for.
    async fn tracked_clients(&self) -> MetadataResult<Vec<ClientRow>>;

    async fn clients_for_tenant(&self, tenant_id: i16) -> MetadataResult<Vec<ClientRow>>;
}

#[async_trait]
impl TenantRepo for PostgresStore {
    async fn list_tenants(&self) -> MetadataResult<Vec<TenantRow>> {
        let rows = sqlx::query_as::<_, TenantRow>("SELECT * FROM tenants ORDER BY tenant_id")
            .fetch_all(self.pool())
            .await?;
        Ok(rows)
    }

    async fn tenant(&self, tenant_id: i16) -> MetadataResult<Option<TenantRow>> {
        let row = sqlx::query_as::<_, TenantRow>("SELECT * FROM tenants WHERE tenant_id = $1")
            .bind(tenant_id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row)
    }

    async fn tenant_by_policy(&self, policy_cid: &str) -> MetadataResult<Option<TenantRow>> {
        let row =
            sqlx::query_as::<_, TenantRow>("SELECT * FROM tenants WHERE tenant_policy_cid = $1")
                .bind(policy_cid)
                .fetch_optional(self.pool())
                .await?;
        Ok(row)
    }

    async fn tracked_clients(&self) -> MetadataResult<Vec<ClientRow>> {
        let rows = sqlx::query_as::<_, ClientRow>(
            "SELECT * FROM clients WHERE tenant_id IS NOT NULL ORDER BY client_id",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    async fn clients_for_tenant(&self, tenant_id: i16) -> MetadataResult<Vec<ClientRow>> {
        let rows = sqlx::query_as::<_, ClientRow>(
            "SELECT * FROM clients WHERE tenant_id = $1 ORDER BY client_id",
        )
        .bind(tenant_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }
}
