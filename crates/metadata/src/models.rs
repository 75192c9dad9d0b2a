//! Database models mapping to the broker schema.

use sqlx::types::Json;
use sqlx::FromRow;
use stevedore_core::meta::{ClientMeta, DealMeta, PieceMeta, ProposalMeta, TenantMeta};
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// Tenants and their chain clients
// =============================================================================

/// Tenant record with its replication policy caps.
#[derive(Debug, Clone, FromRow)]
pub struct TenantRow {
    pub tenant_id: i16,
    pub tenant_name: Option<String>,
    pub tenant_policy_cid: String,
    pub max_total: i16,
    pub max_per_org: i16,
    pub max_per_city: i16,
    pub max_per_country: i16,
    pub max_per_continent: i16,
    pub max_in_flight_bytes: i64,
    pub deal_duration_days: i32,
    pub tenant_meta: Json<TenantMeta>,
}

/// On-chain client address associated with a tenant.
#[derive(Debug, Clone, FromRow)]
pub struct ClientRow {
    /// Bare actor id.
    pub client_id: i64,
    pub tenant_id: Option<i16>,
    /// Robust address form, when attested.
    pub client_robust: Option<String>,
    pub client_meta: Json<ClientMeta>,
}

// =============================================================================
// Pieces and segment relations
// =============================================================================

/// Piece record.
#[derive(Debug, Clone, FromRow)]
pub struct PieceRow {
    pub piece_id: i64,
    pub piece_cid: String,
    pub piece_log2_size: i16,
    pub piece_meta: Json<PieceMeta>,
    pub entry_created: OffsetDateTime,
}

/// Aggregate-to-segment edge.
#[derive(Debug, Clone, FromRow)]
pub struct PieceSegmentRow {
    pub piece_id: i64,
    pub segment_id: i64,
    pub position: i64,
}

// =============================================================================
// Providers
// =============================================================================

/// Storage provider record: chain-attested info plus operator geodata.
#[derive(Debug, Clone, FromRow)]
pub struct ProviderRow {
    pub provider_id: i64,
    pub peer_id: Option<String>,
    pub multiaddrs: Vec<String>,
    pub sector_log2_size: Option<i16>,
    pub org: String,
    pub city: String,
    pub country: String,
    pub continent: String,
    pub is_suspended: bool,
    pub eligible_to_mine: bool,
    pub info_refreshed_at: Option<OffsetDateTime>,
}

impl ProviderRow {
    /// Provider has a peer id and at least one attested multiaddr.
    pub fn is_dialable(&self) -> bool {
        self.peer_id.is_some() && !self.multiaddrs.is_empty()
    }

    /// Info freshness check against the staleness window.
    pub fn info_is_fresh(&self, now: OffsetDateTime) -> bool {
        match self.info_refreshed_at {
            Some(at) => {
                now - at < time::Duration::minutes(stevedore_core::SP_INFO_STALE_AFTER_MINUTES)
            }
            None => false,
        }
    }
}

// =============================================================================
// Proposals
// =============================================================================

/// Proposal record: the broker-side lifecycle row.
#[derive(Debug, Clone, FromRow)]
pub struct ProposalRow {
    pub proposal_uuid: Uuid,
    pub piece_id: i64,
    pub provider_id: i64,
    pub client_id: i64,
    pub start_epoch: i64,
    pub end_epoch: i64,
    pub entry_created: OffsetDateTime,
    pub signature_obtained: Option<OffsetDateTime>,
    pub proposal_delivered: Option<OffsetDateTime>,
    /// Nanosecond failstamp; 0 means the proposal is live.
    pub proposal_failstamp: i64,
    pub activated_deal_id: Option<i64>,
    pub proposal_meta: Json<ProposalMeta>,
}

impl ProposalRow {
    /// Live in-flight: not failed, not yet matched to an activated deal.
    pub fn is_live(&self) -> bool {
        self.proposal_failstamp == 0 && self.activated_deal_id.is_none()
    }
}

/// Join row feeding the delivery stage: proposal payload plus the
/// provider's dialing info.
#[derive(Debug, Clone, FromRow)]
pub struct DeliveryRow {
    pub proposal_uuid: Uuid,
    pub provider_id: i64,
    pub entry_created: OffsetDateTime,
    pub proposal_meta: Json<ProposalMeta>,
    pub peer_id: Option<String>,
    pub multiaddrs: Vec<String>,
}

/// Join row for the pending-proposals API listing.
#[derive(Debug, Clone, FromRow)]
pub struct PendingProposalRow {
    pub proposal_uuid: Uuid,
    pub piece_cid: String,
    pub piece_id: i64,
    pub piece_log2_size: i16,
    pub start_epoch: i64,
    pub tenant_id: i16,
    pub client_robust: Option<String>,
    pub client_id: i64,
    pub proposal_meta: Json<ProposalMeta>,
    pub is_frc58_segmented: bool,
}

/// Join row for the recent-failures API listing.
#[derive(Debug, Clone, FromRow)]
pub struct ProposalFailureRow {
    pub proposal_uuid: Uuid,
    pub piece_cid: String,
    pub tenant_id: i16,
    pub client_robust: Option<String>,
    pub client_id: i64,
    pub failed_at: OffsetDateTime,
    pub proposal_meta: Json<ProposalMeta>,
}

// =============================================================================
// Published deals
// =============================================================================

/// On-chain deal record, maintained exclusively by the reconciler.
#[derive(Debug, Clone, FromRow)]
pub struct PublishedDealRow {
    pub deal_id: i64,
    pub client_id: i64,
    pub provider_id: i64,
    pub piece_id: i64,
    pub claimed_log2_size: i16,
    pub label: Option<Vec<u8>>,
    pub decoded_label: Option<String>,
    pub is_filplus: bool,
    pub status: String,
    pub start_epoch: i64,
    pub end_epoch: i64,
    pub sector_start_epoch: Option<i64>,
    pub published_deal_meta: Json<DealMeta>,
}

/// Slim view of a stored deal, used to diff against the chain walk.
#[derive(Debug, Clone, FromRow)]
pub struct DealBrief {
    pub deal_id: i64,
    pub piece_id: i64,
    pub status: String,
}

// =============================================================================
// Query-shaped rows
// =============================================================================

/// One row of the eligibility listing functions.
#[derive(Debug, Clone, FromRow)]
pub struct EligiblePieceRow {
    pub piece_id: i64,
    pub piece_cid: String,
    pub piece_log2_size: i16,
    pub tenant_ids: Vec<i16>,
}

/// Replication-state vector row for one (provider, tenant) pair.
#[derive(Debug, Clone, FromRow)]
pub struct ReplicationStateRow {
    pub tenant_id: i16,
    pub client_robust: Option<String>,
    pub max_in_flight_bytes: i64,
    pub cur_in_flight_bytes: i64,
    pub max_total: i16,
    pub max_per_org: i16,
    pub max_per_city: i16,
    pub max_per_country: i16,
    pub max_per_continent: i16,
    pub cur_total: i16,
    pub cur_in_org: i16,
    pub cur_in_city: i16,
    pub cur_in_country: i16,
    pub cur_in_continent: i16,
    pub deal_already_exists: bool,
}

/// One segment row of a piece manifest, with the tenant's URL template.
#[derive(Debug, Clone, FromRow)]
pub struct SegmentSourceRow {
    pub agg_pcid_v1: String,
    pub agg_log2_size: i16,
    pub seg_pcid_v2: String,
    pub position: i64,
    pub url_template: Option<String>,
}

/// The reconciler's pinned chain view, stored in the global snapshot.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MarketStateSnapshot {
    pub epoch: i64,
    pub tipset: Vec<String>,
}
