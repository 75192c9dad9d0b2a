//! Proposal lifecycle repository.
//!
//! Mutations here are the only writers of proposal rows after reservation:
//! the signing stage, the delivery stage and the reconciler. Every terminal
//! write is guarded on `proposal_failstamp = 0` so replayed cron runs are
//! no-ops.

use crate::error::MetadataResult;
use crate::models::{DeliveryRow, PendingProposalRow, ProposalFailureRow, ProposalRow};
use crate::postgres::PostgresStore;
use async_trait::async_trait;
use sqlx::types::Json;
use stevedore_core::deal::Signature;
use stevedore_core::meta::TimingSample;
use time::OffsetDateTime;
use uuid::Uuid;

#[async_trait]
pub trait ProposalRepo: Send + Sync {
    /// Live proposals awaiting a client signature, oldest first.
    async fn proposals_pending_signature(&self) -> MetadataResult<Vec<ProposalRow>>;

    /// Record a signature and the signed-proposal CID.
    async fn store_signature(
        &self,
        proposal_uuid: Uuid,
        signature: &Signature,
        signed_proposal_cid: &str,
    ) -> MetadataResult<()>;

    /// Failstamp a live proposal with a failure message. Idempotent: an
    /// already-failed row keeps its original stamp and message.
    async fn fail_proposal(&self, proposal_uuid: Uuid, reason: &str) -> MetadataResult<()>;

    /// Signed, undelivered, unfailed proposals joined with provider dialing
    /// info, in `entry_created` order.
    async fn proposals_pending_delivery(&self) -> MetadataResult<Vec<DeliveryRow>>;

    /// Append a delivery timing sample to the proposal meta.
    async fn record_delivery_attempt(
        &self,
        proposal_uuid: Uuid,
        sample: &TimingSample,
    ) -> MetadataResult<()>;

    async fn mark_delivered(&self, proposal_uuid: Uuid) -> MetadataResult<()>;

    /// Live proposals of one provider for the pending-proposals listing.
    async fn pending_for_provider(
        &self,
        provider_id: i64,
    ) -> MetadataResult<Vec<PendingProposalRow>>;

    /// Failstamped proposals of one provider since the given time.
    async fn recent_failures(
        &self,
        provider_id: i64,
        since: OffsetDateTime,
    ) -> MetadataResult<Vec<ProposalFailureRow>>;
}

#[async_trait]
impl ProposalRepo for PostgresStore {
    async fn proposals_pending_signature(&self) -> MetadataResult<Vec<ProposalRow>> {
        let rows = sqlx::query_as::<_, ProposalRow>(
            "SELECT * FROM proposals \
             WHERE signature_obtained IS NULL AND proposal_failstamp = 0 \
             ORDER BY entry_created",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    async fn store_signature(
        &self,
        proposal_uuid: Uuid,
        signature: &Signature,
        signed_proposal_cid: &str,
    ) -> MetadataResult<()> {
        sqlx::query(
            "UPDATE proposals SET \
                signature_obtained = NOW(), \
                proposal_meta = JSONB_SET( \
                    JSONB_SET(proposal_meta, '{signature}', $2::JSONB), \
                    '{signed_proposal_cid}', \
                    TO_JSONB($3::TEXT)) \
             WHERE proposal_uuid = $1 AND proposal_failstamp = 0",
        )
        .bind(proposal_uuid)
        .bind(Json(signature))
        .bind(signed_proposal_cid)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn fail_proposal(&self, proposal_uuid: Uuid, reason: &str) -> MetadataResult<()> {
        sqlx::query(
            "UPDATE proposals SET \
                proposal_failstamp = big_now(), \
                proposal_meta = JSONB_SET(proposal_meta, '{failure}', TO_JSONB($2::TEXT)) \
             WHERE proposal_uuid = $1 AND proposal_failstamp = 0",
        )
        .bind(proposal_uuid)
        .bind(reason)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn proposals_pending_delivery(&self) -> MetadataResult<Vec<DeliveryRow>> {
        let rows = sqlx::query_as::<_, DeliveryRow>(
            "SELECT pr.proposal_uuid, pr.provider_id, pr.entry_created, pr.proposal_meta, \
                    pi.peer_id, pi.multiaddrs \
             FROM proposals pr \
             JOIN providers pi ON pi.provider_id = pr.provider_id \
             WHERE pr.proposal_delivered IS NULL \
               AND pr.signature_obtained IS NOT NULL \
               AND pr.proposal_failstamp = 0 \
             ORDER BY pr.entry_created",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    async fn record_delivery_attempt(
        &self,
        proposal_uuid: Uuid,
        sample: &TimingSample,
    ) -> MetadataResult<()> {
        sqlx::query(
            "UPDATE proposals SET proposal_meta = JSONB_SET( \
                proposal_meta, \
                '{delivery_timings}', \
                COALESCE(proposal_meta -> 'delivery_timings', '[]'::JSONB) || $2::JSONB) \
             WHERE proposal_uuid = $1",
        )
        .bind(proposal_uuid)
        .bind(Json(sample))
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn mark_delivered(&self, proposal_uuid: Uuid) -> MetadataResult<()> {
        sqlx::query(
            "UPDATE proposals SET proposal_delivered = NOW() \
             WHERE proposal_uuid = $1 AND proposal_failstamp = 0",
        )
        .bind(proposal_uuid)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn pending_for_provider(
        &self,
        provider_id: i64,
    ) -> MetadataResult<Vec<PendingProposalRow>> {
        let rows = sqlx::query_as::<_, PendingProposalRow>(
            "SELECT pr.proposal_uuid, p.piece_cid, p.piece_id, p.piece_log2_size, \
                    pr.start_epoch, t.tenant_id, cl.client_robust, cl.client_id, \
                    pr.proposal_meta, \
                    COALESCE((p.piece_meta -> 'is_frc58_segmented')::BOOL, false) AS is_frc58_segmented \
             FROM proposals pr \
             JOIN pieces p ON p.piece_id = pr.piece_id \
             JOIN clients cl ON cl.client_id = pr.client_id \
             JOIN tenants t ON t.tenant_id = cl.tenant_id \
             WHERE pr.provider_id = $1 \
               AND pr.proposal_failstamp = 0 \
               AND pr.activated_deal_id IS NULL \
             ORDER BY pr.entry_created",
        )
        .bind(provider_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    async fn recent_failures(
        &self,
        provider_id: i64,
        since: OffsetDateTime,
    ) -> MetadataResult<Vec<ProposalFailureRow>> {
        let since_nanos = since.unix_timestamp_nanos().clamp(0, i64::MAX as i128) as i64;
        let rows = sqlx::query_as::<_, ProposalFailureRow>(
            "SELECT pr.proposal_uuid, p.piece_cid, t.tenant_id, cl.client_robust, cl.client_id, \
                    TO_TIMESTAMP(pr.proposal_failstamp / 1000000000.0) AS failed_at, \
                    pr.proposal_meta \
             FROM proposals pr \
             JOIN pieces p ON p.piece_id = pr.piece_id \
             JOIN clients cl ON cl.client_id = pr.client_id \
             JOIN tenants t ON t.tenant_id = cl.tenant_id \
             WHERE pr.provider_id = $1 AND pr.proposal_failstamp > $2 \
             ORDER BY pr.proposal_failstamp DESC",
        )
        .bind(provider_id)
        .bind(since_nanos)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }
}
