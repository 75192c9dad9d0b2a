//! Piece, segment and claim repository.

use crate::error::MetadataResult;
use crate::models::{PieceRow, SegmentSourceRow};
use crate::postgres::PostgresStore;
use async_trait::async_trait;
use uuid::Uuid;

/// One verified aggregate ready for insertion.
#[derive(Debug, Clone)]
pub struct AggregateIngest {
    /// v1 CID of the aggregate (legacy form, matching deal payloads).
    pub aggregate_cid: String,
    pub aggregate_log2_size: i16,
    /// Segments in aggregation order.
    pub segments: Vec<SegmentIngest>,
}

/// One aggregate segment.
#[derive(Debug, Clone)]
pub struct SegmentIngest {
    /// v2 CID (size-tagged form, used for segment retrieval).
    pub pcid_v2: String,
    pub log2_size: i16,
}

#[async_trait]
pub trait PieceRepo: Send + Sync {
    async fn piece_by_cid(&self, piece_cid: &str) -> MetadataResult<Option<PieceRow>>;

    /// Insert an aggregate, its segments, the ordering relation and the
    /// tenant claim, all in one transaction. Re-ingesting is a no-op.
    async fn ingest_aggregate(&self, tenant_id: i16, agg: &AggregateIngest) -> MetadataResult<()>;

    /// Segment rows for a proposal's piece manifest, in position order.
    /// Scoped to the requesting provider's own pending proposals.
    async fn segment_sources(
        &self,
        proposal_uuid: Uuid,
        provider_id: i64,
    ) -> MetadataResult<Vec<SegmentSourceRow>>;
}

#[async_trait]
impl PieceRepo for PostgresStore {
    async fn piece_by_cid(&self, piece_cid: &str) -> MetadataResult<Option<PieceRow>> {
        let row = sqlx::query_as::<_, PieceRow>("SELECT * FROM pieces WHERE piece_cid = $1")
            .bind(piece_cid)
            .fetch_optional(self.pool())
            .await?;
        Ok(row)
    }

    async fn ingest_aggregate(&self, tenant_id: i16, agg: &AggregateIngest) -> MetadataResult<()> {
        let mut tx = self.pool().begin().await?;

        let agg_id: i64 = sqlx::query_scalar(
            "INSERT INTO pieces (piece_cid, piece_log2_size, piece_meta) \
             VALUES ($1, $2, '{\"is_frc58_segmented\": true}') \
             ON CONFLICT (piece_cid) DO UPDATE SET \
                piece_meta = pieces.piece_meta || '{\"is_frc58_segmented\": true}' \
             RETURNING piece_id",
        )
        .bind(&agg.aggregate_cid)
        .bind(agg.aggregate_log2_size)
        .fetch_one(&mut *tx)
        .await?;

        for (position, seg) in agg.segments.iter().enumerate() {
            let seg_id: i64 = sqlx::query_scalar(
                "INSERT INTO pieces (piece_cid, piece_log2_size) VALUES ($1, $2) \
                 ON CONFLICT (piece_cid) DO UPDATE SET piece_cid = EXCLUDED.piece_cid \
                 RETURNING piece_id",
            )
            .bind(&seg.pcid_v2)
            .bind(seg.log2_size)
            .fetch_one(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO piece_segments (piece_id, segment_id, position) \
                 VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
            )
            .bind(agg_id)
            .bind(seg_id)
            .bind(position as i64)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "INSERT INTO tenants_pieces (tenant_id, piece_id) VALUES ($1, $2) \
             ON CONFLICT DO NOTHING",
        )
        .bind(tenant_id)
        .bind(agg_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn segment_sources(
        &self,
        proposal_uuid: Uuid,
        provider_id: i64,
    ) -> MetadataResult<Vec<SegmentSourceRow>> {
        let rows = sqlx::query_as::<_, SegmentSourceRow>(
            "SELECT \
                ap.piece_cid AS agg_pcid_v1, \
                ap.piece_log2_size AS agg_log2_size, \
                sp.piece_cid AS seg_pcid_v2, \
                ps.position, \
                t.tenant_meta -> 'bulk_piece_source' ->> 'url_template' AS url_template \
             FROM piece_segments ps \
             JOIN pieces ap ON ap.piece_id = ps.piece_id \
             JOIN pieces sp ON sp.piece_id = ps.segment_id \
             JOIN proposals pr ON pr.piece_id = ps.piece_id \
             JOIN clients cl ON cl.client_id = pr.client_id \
             JOIN tenants t ON t.tenant_id = cl.tenant_id \
             WHERE (ap.piece_meta -> 'is_frc58_segmented')::BOOL \
               AND pr.proposal_uuid = $1 \
               AND pr.provider_id = $2 \
               AND pr.proposal_delivered IS NOT NULL \
               AND pr.proposal_failstamp = 0 \
               AND pr.activated_deal_id IS NULL \
             ORDER BY ps.position",
        )
        .bind(proposal_uuid)
        .bind(provider_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }
}
