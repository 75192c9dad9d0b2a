//! Eligibility listing and replication-state queries.

use crate::error::MetadataResult;
use crate::models::{EligiblePieceRow, ReplicationStateRow};
use crate::postgres::PostgresStore;
use async_trait::async_trait;

/// Replica counts for one (tenant, piece) pair relative to a provider's
/// geography: chain truth from the matviews plus live proposal rows.
const REPLICATION_STATE_SQL: &str = "\
SELECT t.tenant_id, \
       (SELECT cl.client_robust FROM clients cl \
         WHERE cl.tenant_id = t.tenant_id \
         ORDER BY COALESCE((cl.client_meta -> 'activatable_datacap')::BIGINT, 0) DESC \
         LIMIT 1) AS client_robust, \
       t.max_in_flight_bytes, \
       COALESCE((SELECT SUM(1::BIGINT << fpp.piece_log2_size) \
           FROM proposals fp \
           JOIN pieces fpp ON fpp.piece_id = fp.piece_id \
           JOIN clients fc ON fc.client_id = fp.client_id \
          WHERE fp.provider_id = $1 AND fc.tenant_id = t.tenant_id \
            AND fp.proposal_failstamp = 0 AND fp.activated_deal_id IS NULL), 0)::BIGINT \
           AS cur_in_flight_bytes, \
       t.max_total, t.max_per_org, t.max_per_city, t.max_per_country, t.max_per_continent, \
       ((SELECT COUNT(*) FROM mv_deals_prefiltered_for_repcount d \
          WHERE d.tenant_id = t.tenant_id AND d.piece_id = $2) \
        + (SELECT COUNT(*) FROM proposals lp \
             JOIN clients lc ON lc.client_id = lp.client_id \
            WHERE lp.piece_id = $2 AND lc.tenant_id = t.tenant_id \
              AND lp.proposal_failstamp = 0 AND lp.activated_deal_id IS NULL))::SMALLINT \
           AS cur_total, \
       ((SELECT COUNT(*) FROM mv_deals_prefiltered_for_repcount d \
          WHERE d.tenant_id = t.tenant_id AND d.piece_id = $2 AND d.org = pr.org) \
        + (SELECT COUNT(*) FROM proposals lp \
             JOIN clients lc ON lc.client_id = lp.client_id \
             JOIN providers lpr ON lpr.provider_id = lp.provider_id \
            WHERE lp.piece_id = $2 AND lc.tenant_id = t.tenant_id AND lpr.org = pr.org \
              AND lp.proposal_failstamp = 0 AND lp.activated_deal_id IS NULL))::SMALLINT \
           AS cur_in_org, \
       ((SELECT COUNT(*) FROM mv_deals_prefiltered_for_repcount d \
          WHERE d.tenant_id = t.tenant_id AND d.piece_id = $2 AND d.city = pr.city) \
        + (SELECT COUNT(*) FROM proposals lp \
             JOIN clients lc ON lc.client_id = lp.client_id \
             JOIN providers lpr ON lpr.provider_id = lp.provider_id \
            WHERE lp.piece_id = $2 AND lc.tenant_id = t.tenant_id AND lpr.city = pr.city \
              AND lp.proposal_failstamp = 0 AND lp.activated_deal_id IS NULL))::SMALLINT \
           AS cur_in_city, \
       ((SELECT COUNT(*) FROM mv_deals_prefiltered_for_repcount d \
          WHERE d.tenant_id = t.tenant_id AND d.piece_id = $2 AND d.country = pr.country) \
        + (SELECT COUNT(*) FROM proposals lp \
             JOIN clients lc ON lc.client_id = lp.client_id \
             JOIN providers lpr ON lpr.provider_id = lp.provider_id \
            WHERE lp.piece_id = $2 AND lc.tenant_id = t.tenant_id AND lpr.country = pr.country \
              AND lp.proposal_failstamp = 0 AND lp.activated_deal_id IS NULL))::SMALLINT \
           AS cur_in_country, \
       ((SELECT COUNT(*) FROM mv_deals_prefiltered_for_repcount d \
          WHERE d.tenant_id = t.tenant_id AND d.piece_id = $2 AND d.continent = pr.continent) \
        + (SELECT COUNT(*) FROM proposals lp \
             JOIN clients lc ON lc.client_id = lp.client_id \
             JOIN providers lpr ON lpr.provider_id = lp.provider_id \
            WHERE lp.piece_id = $2 AND lc.tenant_id = t.tenant_id AND lpr.continent = pr.continent \
              AND lp.proposal_failstamp = 0 AND lp.activated_deal_id IS NULL))::SMALLINT \
           AS cur_in_continent, \
       EXISTS (SELECT 1 FROM mv_deals_prefiltered_for_repcount d \
                WHERE d.tenant_id = t.tenant_id AND d.piece_id = $2 AND d.provider_id = $1) \
           AS deal_already_exists \
  FROM tenants t \
  JOIN tenants_pieces tp ON tp.tenant_id = t.tenant_id AND tp.piece_id = $2 \
  JOIN providers pr ON pr.provider_id = $1 \
 ORDER BY t.tenant_id";

#[async_trait]
pub trait EligibilityRepo: Send + Sync {
    /// The ordered eligible-piece listing for one SP. `full` selects the
    /// materialized cross-product strategy over the cheap head strategy;
    /// both return the same set restricted to the top `limit`.
    async fn eligible_pieces(
        &self,
        provider_id: i64,
        limit: i64,
        tenant_id: i16,
        include_sourceless: bool,
        full: bool,
    ) -> MetadataResult<Vec<EligiblePieceRow>>;

    /// Replication-state vector for (provider, piece): one row per claiming
    /// tenant.
    async fn replication_states(
        &self,
        provider_id: i64,
        piece_id: i64,
    ) -> MetadataResult<Vec<ReplicationStateRow>>;
}

#[async_trait]
impl EligibilityRepo for PostgresStore {
    async fn eligible_pieces(
        &self,
        provider_id: i64,
        limit: i64,
        tenant_id: i16,
        include_sourceless: bool,
        full: bool,
    ) -> MetadataResult<Vec<EligiblePieceRow>> {
        let func = if full {
            "pieces_eligible_full"
        } else {
            "pieces_eligible_head"
        };
        let rows = sqlx::query_as::<_, EligiblePieceRow>(&format!(
            "SELECT * FROM {func}($1, $2, $3, $4, $5)"
        ))
        .bind(provider_id)
        .bind(limit)
        .bind(tenant_id)
        .bind(include_sourceless)
        .bind(false)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    async fn replication_states(
        &self,
        provider_id: i64,
        piece_id: i64,
    ) -> MetadataResult<Vec<ReplicationStateRow>> {
        let rows = sqlx::query_as::<_, ReplicationStateRow>(REPLICATION_STATE_SQL)
            .bind(provider_id)
            .bind(piece_id)
            .fetch_all(self.pool())
            .await?;
        Ok(rows)
    }
}
