//! Provider repository.

use crate::error::MetadataResult;
use crate::models::ProviderRow;
use crate::postgres::PostgresStore;
use async_trait::async_trait;

#[async_trait]
pub trait ProviderRepo: Send + Sync {
    async fn provider(&self, provider_id: i64) -> MetadataResult<Option<ProviderRow>>;

    /// Every provider the poller should refresh.
    async fn known_provider_ids(&self) -> MetadataResult<Vec<i64>>;

    /// Write back chain-attested info. Operator-maintained columns (geodata,
    /// suspension) are deliberately untouched.
    async fn update_provider_chain_info(
        &self,
        provider_id: i64,
        peer_id: Option<&str>,
        multiaddrs: &[String],
        sector_log2_size: i16,
        eligible_to_mine: bool,
    ) -> MetadataResult<()>;
}

#[async_trait]
impl ProviderRepo for PostgresStore {
    async fn provider(&self, provider_id: i64) -> MetadataResult<Option<ProviderRow>> {
        let row = sqlx::query_as::<_, ProviderRow>(
            "SELECT provider_id, peer_id, multiaddrs, sector_log2_size, org, city, country, \
             continent, is_suspended, eligible_to_mine, info_refreshed_at \
             FROM providers WHERE provider_id = $1",
        )
        .bind(provider_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    async fn known_provider_ids(&self) -> MetadataResult<Vec<i64>> {
        let ids: Vec<(i64,)> = sqlx::query_as("SELECT provider_id FROM providers ORDER BY provider_id")
            .fetch_all(self.pool())
            .await?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    async fn update_provider_chain_info(
        &self,
        provider_id: i64,
        peer_id: Option<&str>,
        multiaddrs: &[String],
        sector_log2_size: i16,
        eligible_to_mine: bool,
    ) -> MetadataResult<()> {
        sqlx::query(
            "UPDATE providers SET \
                peer_id = $2, \
                multiaddrs = $3, \
                sector_log2_size = $4, \
                eligible_to_mine = $5, \
                info_refreshed_at = NOW() \
             WHERE provider_id = $1",
        )
        .bind(provider_id)
        .bind(peer_id)
        .bind(multiaddrs)
        .bind(sector_log2_size)
        .bind(eligible_to_mine)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}
