//! Published-deal repository and the reconciliation transaction.

use crate::error::MetadataResult;
use crate::models::{DealBrief, MarketStateSnapshot, PublishedDealRow};
use crate::postgres::PostgresStore;
use crate::repos::matviews;
use async_trait::async_trait;
use sqlx::types::Json;
use stevedore_core::epoch::EPOCHS_IN_DAY;
use stevedore_core::meta::DealMeta;

/// One chain deal to upsert.
#[derive(Debug, Clone)]
pub struct DealUpsert {
    pub deal_id: i64,
    pub client_id: i64,
    pub provider_id: i64,
    pub piece_cid: String,
    pub claimed_log2_size: i16,
    pub label: Vec<u8>,
    pub decoded_label: Option<String>,
    pub is_filplus: bool,
    pub status: String,
    pub termination_reason: Option<String>,
    pub start_epoch: i64,
    pub end_epoch: i64,
    pub sector_start_epoch: Option<i64>,
    /// True when the deal transitioned into `active` this run; triggers
    /// proposal matching.
    pub newly_active: bool,
}

/// Everything the reconciler computed from one chain walk.
#[derive(Debug, Clone)]
pub struct ReconcileUpdate {
    pub upserts: Vec<DealUpsert>,
    /// Deals we track locally that vanished from the market state.
    pub absent_deal_ids: Vec<i64>,
    /// Projected datacap per tracked client actor id.
    pub client_datacaps: Vec<(i64, i64)>,
    pub observed: MarketStateSnapshot,
}

/// Row counts from a reconcile application, for the run summary.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReconcileOutcome {
    pub deals_upserted: u64,
    pub deals_terminated_missing: u64,
    pub proposals_activated: u64,
    pub proposals_failed_start_missed: u64,
    pub proposals_failed_terminated: u64,
    pub proposals_failed_invalidated: u64,
    pub pieces_size_proven: u64,
}

#[async_trait]
pub trait DealRepo: Send + Sync {
    /// Slim dump of every tracked deal, for diffing against the chain walk.
    async fn all_deals_brief(&self) -> MetadataResult<Vec<DealBrief>>;

    async fn deal(&self, deal_id: i64) -> MetadataResult<Option<PublishedDealRow>>;

    /// Apply one full reconciliation in a single transaction: deal upserts,
    /// terminations, datacap reprojection, proposal compensation, size
    /// proofs, global snapshot and matview refresh. A crash anywhere leaves
    /// the previous snapshot fully intact.
    async fn apply_reconciliation(
        &self,
        update: &ReconcileUpdate,
    ) -> MetadataResult<ReconcileOutcome>;
}

#[async_trait]
impl DealRepo for PostgresStore {
    async fn all_deals_brief(&self) -> MetadataResult<Vec<DealBrief>> {
        let rows = sqlx::query_as::<_, DealBrief>(
            "SELECT deal_id, piece_id, status FROM published_deals",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    async fn deal(&self, deal_id: i64) -> MetadataResult<Option<PublishedDealRow>> {
        let row = sqlx::query_as::<_, PublishedDealRow>(
            "SELECT deal_id, client_id, provider_id, piece_id, claimed_log2_size, label, \
                    decoded_label, is_filplus, status, start_epoch, end_epoch, \
                    sector_start_epoch, published_deal_meta \
             FROM published_deals WHERE deal_id = $1",
        )
        .bind(deal_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    async fn apply_reconciliation(
        &self,
        update: &ReconcileUpdate,
    ) -> MetadataResult<ReconcileOutcome> {
        let mut outcome = ReconcileOutcome::default();
        let mut tx = self.pool().begin().await?;

        // The walk can touch millions of rows; give the transaction room.
        sqlx::query("SET LOCAL statement_timeout = 3600000")
            .execute(&mut *tx)
            .await?;

        for deal in &update.upserts {
            // The market holds deals for pieces nobody claimed yet; track
            // them anyway so replica counting sees the whole picture.
            let piece_id: i64 = sqlx::query_scalar(
                "INSERT INTO pieces (piece_cid, piece_log2_size) VALUES ($1, $2) \
                 ON CONFLICT (piece_cid) DO UPDATE SET piece_cid = EXCLUDED.piece_cid \
                 RETURNING piece_id",
            )
            .bind(&deal.piece_cid)
            .bind(deal.claimed_log2_size)
            .fetch_one(&mut *tx)
            .await?;

            let meta = DealMeta {
                termination_reason: deal.termination_reason.clone(),
                extra: Default::default(),
            };
            sqlx::query(
                "INSERT INTO published_deals \
                    (deal_id, client_id, provider_id, piece_id, claimed_log2_size, label, \
                     decoded_label, is_filplus, status, published_deal_meta, start_epoch, \
                     end_epoch, sector_start_epoch) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10::JSONB, $11, $12, $13) \
                 ON CONFLICT (deal_id) DO UPDATE SET \
                    status = EXCLUDED.status, \
                    published_deal_meta = \
                        published_deals.published_deal_meta || EXCLUDED.published_deal_meta, \
                    sector_start_epoch = \
                        COALESCE(EXCLUDED.sector_start_epoch, published_deals.sector_start_epoch)",
            )
            .bind(deal.deal_id)
            .bind(deal.client_id)
            .bind(deal.provider_id)
            .bind(piece_id)
            .bind(deal.claimed_log2_size)
            .bind(&deal.label)
            .bind(&deal.decoded_label)
            .bind(deal.is_filplus)
            .bind(&deal.status)
            .bind(Json(&meta))
            .bind(deal.start_epoch)
            .bind(deal.end_epoch)
            .bind(deal.sector_start_epoch)
            .execute(&mut *tx)
            .await?;
            outcome.deals_upserted += 1;

            if deal.newly_active {
                let matched = sqlx::query(
                    "UPDATE proposals SET activated_deal_id = $1 \
                     WHERE proposal_failstamp = 0 \
                       AND proposal_delivered IS NOT NULL \
                       AND activated_deal_id IS NULL \
                       AND piece_id = $2 \
                       AND provider_id = $3 \
                       AND client_id = $4",
                )
                .bind(deal.deal_id)
                .bind(piece_id)
                .bind(deal.provider_id)
                .bind(deal.client_id)
                .execute(&mut *tx)
                .await?;
                outcome.proposals_activated += matched.rows_affected();
            }
        }

        if !update.absent_deal_ids.is_empty() {
            let gone = sqlx::query(
                "UPDATE published_deals SET \
                    status = 'terminated', \
                    published_deal_meta = published_deal_meta || \
                        '{\"termination_reason\": \"deal no longer part of market-actor state\"}' \
                 WHERE deal_id = ANY($1) AND status != 'terminated'",
            )
            .bind(&update.absent_deal_ids)
            .execute(&mut *tx)
            .await?;
            outcome.deals_terminated_missing = gone.rows_affected();
        }

        for (client_id, datacap) in &update.client_datacaps {
            sqlx::query(
                "UPDATE clients SET \
                    client_meta = JSONB_SET(client_meta, '{activatable_datacap}', TO_JSONB($1::BIGINT)) \
                 WHERE client_id = $2",
            )
            .bind(datacap)
            .bind(client_id)
            .execute(&mut *tx)
            .await?;
        }

        // Anything that activated is by definition the correct size.
        let proven = sqlx::query(
            "UPDATE pieces SET \
                piece_meta = piece_meta || '{\"size_proven_correct\": true}', \
                piece_log2_size = active.claimed_log2_size \
             FROM (SELECT DISTINCT ON (pd.piece_id) pd.piece_id, pd.claimed_log2_size \
                     FROM published_deals pd WHERE pd.status = 'active') active \
             WHERE pieces.piece_id = active.piece_id \
               AND NOT COALESCE((pieces.piece_meta -> 'size_proven_correct')::BOOL, false)",
        )
        .execute(&mut *tx)
        .await?;
        outcome.pieces_size_proven = proven.rows_affected();

        // Proposals that will never make their start epoch.
        let missed = sqlx::query(
            "UPDATE proposals SET \
                proposal_failstamp = big_now(), \
                proposal_meta = JSONB_SET(proposal_meta, '{failure}', \
                    TO_JSONB('proposal DealStartEpoch missed without activation'::TEXT)) \
             WHERE proposal_failstamp = 0 \
               AND activated_deal_id IS NULL \
               AND start_epoch < $1",
        )
        .bind(update.observed.epoch - EPOCHS_IN_DAY)
        .execute(&mut *tx)
        .await?;
        outcome.proposals_failed_start_missed = missed.rows_affected();

        // Proposals whose activated deal has since terminated.
        let terminated = sqlx::query(
            "UPDATE proposals SET \
                activated_deal_id = NULL, \
                proposal_failstamp = big_now(), \
                proposal_meta = JSONB_SET(proposal_meta, '{failure}', \
                    TO_JSONB('sector containing deal was terminated'::TEXT)) \
             WHERE activated_deal_id IN \
                (SELECT deal_id FROM published_deals WHERE status = 'terminated')",
        )
        .execute(&mut *tx)
        .await?;
        outcome.proposals_failed_terminated = terminated.rows_affected();

        // Proposals whose activated deal was declared invalid out of band.
        let invalidated = sqlx::query(
            "UPDATE proposals SET \
                proposal_failstamp = big_now(), \
                proposal_meta = JSONB_SET(proposal_meta, '{failure}', \
                    TO_JSONB('deal declared invalid'::TEXT)) \
             WHERE proposal_failstamp = 0 \
               AND activated_deal_id IN (SELECT deal_id FROM invalidated_deals)",
        )
        .execute(&mut *tx)
        .await?;
        outcome.proposals_failed_invalidated = invalidated.rows_affected();

        sqlx::query("UPDATE global SET metadata = JSONB_SET(metadata, '{market_state}', $1::JSONB)")
            .bind(Json(&update.observed))
            .execute(&mut *tx)
            .await?;

        matviews::refresh_all(&mut tx).await?;

        tx.commit().await?;
        Ok(outcome)
    }
}
