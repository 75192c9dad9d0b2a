//! The reservation engine: transactional accept/reject of piece
//! reservations, synthesizing the unsigned deal payload on acceptance.
//!
//! The admissibility check runs inside a serializable transaction so the
//! counts it reads are the counts it commits against. A serialization
//! failure (another SP won a concurrent race) retries the whole check a
//! bounded number of times before giving up.

use crate::error::{MetadataError, MetadataResult};
use crate::models::{ClientRow, MarketStateSnapshot, PieceRow, ProviderRow, TenantRow};
use crate::postgres::PostgresStore;
use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{FromRow, Postgres, Transaction};
use stevedore_core::address::Address;
use stevedore_core::deal::{DealProposal, Label, TokenAmount};
use stevedore_core::epoch::{epoch_to_time, EPOCHS_IN_DAY};
use stevedore_core::meta::ProposalMeta;
use stevedore_core::piece::CommP;
use stevedore_core::DEAL_START_DELAY_EPOCHS;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

/// Attempts before a serialization-failure loop is declared lost.
const MAX_RESERVE_ATTEMPTS: u32 = 3;

/// Structured admissibility denial. Each variant maps onto one entry of the
/// public error-code table.
#[derive(Debug, Clone, Error)]
pub enum ReservationDenied {
    #[error("piece of 2^{piece_log2_size} bytes exceeds provider sector size 2^{sector_log2_size}")]
    OversizedPiece {
        piece_log2_size: i16,
        sector_log2_size: i16,
    },

    #[error("storage provider is suspended")]
    StorageProviderSuspended,

    #[error("storage provider is currently ineligible to mine")]
    StorageProviderIneligibleToMine,

    #[error("on-chain provider info has not been refreshed recently enough")]
    StorageProviderInfoTooOld,

    #[error("provider not dialable: insufficient information published on chain")]
    StorageProviderUndialable,

    #[error("storage provider is not served by this system")]
    StorageProviderUnsupported,

    #[error("piece {0} is not claimed under the requested tenant policy")]
    UnclaimedPieceCid(String),

    #[error("provider already holds a replica of this piece for this tenant")]
    ProviderHasReplica,

    #[error("no tenant client currently has sufficient datacap for this piece")]
    TenantsOutOfDatacap,

    #[error("replication caps for this piece are exhausted")]
    TooManyReplicas,

    #[error("provider is above its in-flight byte budget for this tenant")]
    ProviderAboveMaxInFlight,

    #[error("reservation rejected by replication rules")]
    ReplicationRulesViolation,

    #[error("reservation refused by tenant-side external check")]
    ExternalReservationRefused,
}

impl ReservationDenied {
    /// The public error code this denial surfaces as.
    pub fn api_code(&self) -> stevedore_core::api::ApiErrorCode {
        use stevedore_core::api::ApiErrorCode as C;
        match self {
            Self::OversizedPiece { .. } => C::OversizedPiece,
            Self::StorageProviderSuspended => C::StorageProviderSuspended,
            Self::StorageProviderIneligibleToMine => C::StorageProviderIneligibleToMine,
            Self::StorageProviderInfoTooOld => C::StorageProviderInfoTooOld,
            Self::StorageProviderUndialable => C::StorageProviderUndialable,
            Self::StorageProviderUnsupported => C::StorageProviderUnsupported,
            Self::UnclaimedPieceCid(_) => C::UnclaimedPieceCid,
            Self::ProviderHasReplica => C::ProviderHasReplica,
            Self::TenantsOutOfDatacap => C::TenantsOutOfDatacap,
            Self::TooManyReplicas => C::TooManyReplicas,
            Self::ProviderAboveMaxInFlight => C::ProviderAboveMaxInFlight,
            Self::ReplicationRulesViolation => C::ReplicationRulesViolation,
            Self::ExternalReservationRefused => C::ExternalReservationRefused,
        }
    }
}

/// Reservation failure: a policy denial or an infrastructure error.
#[derive(Debug, Error)]
pub enum ReservationError {
    #[error("{0}")]
    Denied(#[from] ReservationDenied),

    #[error(transparent)]
    Store(#[from] MetadataError),
}

/// A committed reservation.
#[derive(Debug, Clone)]
pub struct ReservationOutcome {
    pub proposal_uuid: Uuid,
    pub piece_id: i64,
    pub tenant_id: i16,
    pub client_id: i64,
    pub start_epoch: i64,
    pub end_epoch: i64,
    pub start_time: OffsetDateTime,
}

#[async_trait]
pub trait ReservationRepo: Send + Sync {
    /// Atomically reserve `piece_cid` for `provider_id` under the given
    /// tenant's policy, inserting the unsigned proposal row on success.
    async fn reserve_piece(
        &self,
        provider_id: i64,
        piece_cid: &str,
        tenant: &TenantRow,
    ) -> Result<ReservationOutcome, ReservationError>;
}

#[derive(Debug, FromRow)]
struct CapCheckRow {
    total_maxed: bool,
    org_maxed: bool,
    city_maxed: bool,
    country_maxed: bool,
    continent_maxed: bool,
    in_flight_exceeded: bool,
}

const CAP_CHECK_SQL: &str = "\
SELECT \
  ((SELECT COUNT(*) FROM mv_deals_prefiltered_for_repcount d \
     WHERE d.tenant_id = t.tenant_id AND d.piece_id = $2) \
   + (SELECT COUNT(*) FROM proposals lp \
        JOIN clients lc ON lc.client_id = lp.client_id \
       WHERE lp.piece_id = $2 AND lc.tenant_id = t.tenant_id \
         AND lp.proposal_failstamp = 0 AND lp.activated_deal_id IS NULL)) >= t.max_total \
      AS total_maxed, \
  ((SELECT COUNT(*) FROM mv_deals_prefiltered_for_repcount d \
     WHERE d.tenant_id = t.tenant_id AND d.piece_id = $2 AND d.org = pr.org) \
   + (SELECT COUNT(*) FROM proposals lp \
        JOIN clients lc ON lc.client_id = lp.client_id \
        JOIN providers lpr ON lpr.provider_id = lp.provider_id \
       WHERE lp.piece_id = $2 AND lc.tenant_id = t.tenant_id AND lpr.org = pr.org \
         AND lp.proposal_failstamp = 0 AND lp.activated_deal_id IS NULL)) >= t.max_per_org \
      AS org_maxed, \
  ((SELECT COUNT(*) FROM mv_deals_prefiltered_for_repcount d \
     WHERE d.tenant_id = t.tenant_id AND d.piece_id = $2 AND d.city = pr.city) \
   + (SELECT COUNT(*) FROM proposals lp \
        JOIN clients lc ON lc.client_id = lp.client_id \
        JOIN providers lpr ON lpr.provider_id = lp.provider_id \
       WHERE lp.piece_id = $2 AND lc.tenant_id = t.tenant_id AND lpr.city = pr.city \
         AND lp.proposal_failstamp = 0 AND lp.activated_deal_id IS NULL)) >= t.max_per_city \
      AS city_maxed, \
  ((SELECT COUNT(*) FROM mv_deals_prefiltered_for_repcount d \
     WHERE d.tenant_id = t.tenant_id AND d.piece_id = $2 AND d.country = pr.country) \
   + (SELECT COUNT(*) FROM proposals lp \
        JOIN clients lc ON lc.client_id = lp.client_id \
        JOIN providers lpr ON lpr.provider_id = lp.provider_id \
       WHERE lp.piece_id = $2 AND lc.tenant_id = t.tenant_id AND lpr.country = pr.country \
         AND lp.proposal_failstamp = 0 AND lp.activated_deal_id IS NULL)) >= t.max_per_country \
      AS country_maxed, \
  ((SELECT COUNT(*) FROM mv_deals_prefiltered_for_repcount d \
     WHERE d.tenant_id = t.tenant_id AND d.piece_id = $2 AND d.continent = pr.continent) \
   + (SELECT COUNT(*) FROM proposals lp \
        JOIN clients lc ON lc.client_id = lp.client_id \
        JOIN providers lpr ON lpr.provider_id = lp.provider_id \
       WHERE lp.piece_id = $2 AND lc.tenant_id = t.tenant_id AND lpr.continent = pr.continent \
         AND lp.proposal_failstamp = 0 AND lp.activated_deal_id IS NULL)) >= t.max_per_continent \
      AS continent_maxed, \
  (COALESCE((SELECT SUM(1::BIGINT << fpp.piece_log2_size) \
      FROM proposals fp \
      JOIN pieces fpp ON fpp.piece_id = fp.piece_id \
      JOIN clients fc ON fc.client_id = fp.client_id \
     WHERE fp.provider_id = $3 AND fc.tenant_id = t.tenant_id \
       AND fp.proposal_failstamp = 0 AND fp.activated_deal_id IS NULL), 0) + $4) \
      > t.max_in_flight_bytes \
      AS in_flight_exceeded \
FROM tenants t \
JOIN providers pr ON pr.provider_id = $3 \
WHERE t.tenant_id = $1";

#[async_trait]
impl ReservationRepo for PostgresStore {
    async fn reserve_piece(
        &self,
        provider_id: i64,
        piece_cid: &str,
        tenant: &TenantRow,
    ) -> Result<ReservationOutcome, ReservationError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match try_reserve(self, provider_id, piece_cid, tenant).await {
                Err(ReservationError::Store(e))
                    if e.is_serialization_failure() && attempt < MAX_RESERVE_ATTEMPTS =>
                {
                    tracing::debug!(attempt, provider_id, piece_cid, "reservation retry");
                    continue;
                }
                Err(ReservationError::Store(e)) if e.is_serialization_failure() => {
                    return Err(ReservationDenied::ReplicationRulesViolation.into());
                }
                other => return other,
            }
        }
    }
}

async fn try_reserve(
    store: &PostgresStore,
    provider_id: i64,
    piece_cid: &str,
    tenant: &TenantRow,
) -> Result<ReservationOutcome, ReservationError> {
    let mut tx = store.pool().begin().await.map_err(MetadataError::from)?;
    sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
        .execute(&mut *tx)
        .await
        .map_err(MetadataError::from)?;

    let provider = check_provider(&mut tx, provider_id).await?;
    let piece = check_piece(&mut tx, piece_cid, tenant, &provider).await?;

    if tenant
        .tenant_meta
        .extra
        .get("external_reservation_hold")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
    {
        return Err(ReservationDenied::ExternalReservationRefused.into());
    }

    let piece_size = 1i64 << piece.piece_log2_size;
    let client = pick_client(&mut tx, tenant.tenant_id, piece_size).await?;
    check_replica(&mut tx, provider_id, piece.piece_id, tenant.tenant_id).await?;
    check_caps(&mut tx, tenant.tenant_id, piece.piece_id, provider_id, piece_size).await?;

    // Belt and braces: the listing predicate must agree before we commit.
    let admissible: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM piece_admissible_tenants($1, $2, $3, false))",
    )
    .bind(provider_id)
    .bind(piece.piece_id)
    .bind(tenant.tenant_id)
    .fetch_one(&mut *tx)
    .await
    .map_err(MetadataError::from)?;
    if !admissible {
        return Err(ReservationDenied::ReplicationRulesViolation.into());
    }

    let snapshot = market_snapshot_in_tx(&mut tx).await?;
    let start_epoch = snapshot.epoch + DEAL_START_DELAY_EPOCHS;
    let end_epoch = start_epoch + i64::from(tenant.deal_duration_days) * EPOCHS_IN_DAY;

    let payload = build_payload(&piece, &client, provider_id, start_epoch, end_epoch)
        .map_err(MetadataError::from)?;
    let meta = ProposalMeta {
        filmarket_proposal: Some(payload),
        ..Default::default()
    };

    let proposal_uuid = Uuid::new_v4();
    let inserted = sqlx::query(
        "INSERT INTO proposals \
            (proposal_uuid, piece_id, provider_id, client_id, start_epoch, end_epoch, proposal_meta) \
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(proposal_uuid)
    .bind(piece.piece_id)
    .bind(provider_id)
    .bind(client.client_id)
    .bind(start_epoch)
    .bind(end_epoch)
    .bind(Json(&meta))
    .execute(&mut *tx)
    .await;

    match inserted {
        Ok(_) => {}
        Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some("23505") => {
            // another transaction just reserved the same triple
            return Err(ReservationDenied::ProviderHasReplica.into());
        }
        Err(e) => return Err(MetadataError::from(e).into()),
    }

    tx.commit().await.map_err(MetadataError::from)?;

    Ok(ReservationOutcome {
        proposal_uuid,
        piece_id: piece.piece_id,
        tenant_id: tenant.tenant_id,
        client_id: client.client_id,
        start_epoch,
        end_epoch,
        start_time: epoch_to_time(start_epoch),
    })
}

async fn check_provider(
    tx: &mut Transaction<'_, Postgres>,
    provider_id: i64,
) -> Result<ProviderRow, ReservationError> {
    let provider = sqlx::query_as::<_, ProviderRow>(
        "SELECT provider_id, peer_id, multiaddrs, sector_log2_size, org, city, country, \
         continent, is_suspended, eligible_to_mine, info_refreshed_at \
         FROM providers WHERE provider_id = $1",
    )
    .bind(provider_id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(MetadataError::from)?
    .ok_or(ReservationDenied::StorageProviderUnsupported)?;

    if provider.is_suspended {
        return Err(ReservationDenied::StorageProviderSuspended.into());
    }
    if !provider.eligible_to_mine {
        return Err(ReservationDenied::StorageProviderIneligibleToMine.into());
    }
    if !provider.info_is_fresh(OffsetDateTime::now_utc()) {
        return Err(ReservationDenied::StorageProviderInfoTooOld.into());
    }
    if !provider.is_dialable() {
        return Err(ReservationDenied::StorageProviderUndialable.into());
    }
    Ok(provider)
}

async fn check_piece(
    tx: &mut Transaction<'_, Postgres>,
    piece_cid: &str,
    tenant: &TenantRow,
    provider: &ProviderRow,
) -> Result<PieceRow, ReservationError> {
    let piece = sqlx::query_as::<_, PieceRow>("SELECT * FROM pieces WHERE piece_cid = $1")
        .bind(piece_cid)
        .fetch_optional(&mut **tx)
        .await
        .map_err(MetadataError::from)?
        .ok_or_else(|| ReservationDenied::UnclaimedPieceCid(piece_cid.to_string()))?;

    let claimed: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM tenants_pieces WHERE tenant_id = $1 AND piece_id = $2)",
    )
    .bind(tenant.tenant_id)
    .bind(piece.piece_id)
    .fetch_one(&mut **tx)
    .await
    .map_err(MetadataError::from)?;
    if !claimed {
        return Err(ReservationDenied::UnclaimedPieceCid(piece_cid.to_string()).into());
    }

    let sector_log2_size = provider.sector_log2_size.unwrap_or(0);
    if piece.piece_log2_size > sector_log2_size {
        return Err(ReservationDenied::OversizedPiece {
            piece_log2_size: piece.piece_log2_size,
            sector_log2_size,
        }
        .into());
    }
    Ok(piece)
}

async fn pick_client(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: i16,
    piece_size: i64,
) -> Result<ClientRow, ReservationError> {
    sqlx::query_as::<_, ClientRow>(
        "SELECT * FROM clients \
         WHERE tenant_id = $1 \
           AND COALESCE((client_meta -> 'activatable_datacap')::BIGINT, 0) >= $2 \
         ORDER BY COALESCE((client_meta -> 'activatable_datacap')::BIGINT, 0) DESC \
         LIMIT 1",
    )
    .bind(tenant_id)
    .bind(piece_size)
    .fetch_optional(&mut **tx)
    .await
    .map_err(MetadataError::from)?
    .ok_or_else(|| ReservationDenied::TenantsOutOfDatacap.into())
}

async fn check_replica(
    tx: &mut Transaction<'_, Postgres>,
    provider_id: i64,
    piece_id: i64,
    tenant_id: i16,
) -> Result<(), ReservationError> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM mv_deals_prefiltered_for_repcount d \
            WHERE d.tenant_id = $1 AND d.piece_id = $2 AND d.provider_id = $3) \
         OR EXISTS(SELECT 1 FROM proposals lp \
            JOIN clients lc ON lc.client_id = lp.client_id \
            WHERE lp.piece_id = $2 AND lp.provider_id = $3 AND lc.tenant_id = $1 \
              AND lp.proposal_failstamp = 0 AND lp.activated_deal_id IS NULL)",
    )
    .bind(tenant_id)
    .bind(piece_id)
    .bind(provider_id)
    .fetch_one(&mut **tx)
    .await
    .map_err(MetadataError::from)?;

    if exists {
        return Err(ReservationDenied::ProviderHasReplica.into());
    }
    Ok(())
}

async fn check_caps(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: i16,
    piece_id: i64,
    provider_id: i64,
    piece_size: i64,
) -> Result<(), ReservationError> {
    let caps = sqlx::query_as::<_, CapCheckRow>(CAP_CHECK_SQL)
        .bind(tenant_id)
        .bind(piece_id)
        .bind(provider_id)
        .bind(piece_size)
        .fetch_one(&mut **tx)
        .await
        .map_err(MetadataError::from)?;

    if caps.total_maxed
        || caps.org_maxed
        || caps.city_maxed
        || caps.country_maxed
        || caps.continent_maxed
    {
        return Err(ReservationDenied::TooManyReplicas.into());
    }
    if caps.in_flight_exceeded {
        return Err(ReservationDenied::ProviderAboveMaxInFlight.into());
    }
    Ok(())
}

async fn market_snapshot_in_tx(
    tx: &mut Transaction<'_, Postgres>,
) -> Result<MarketStateSnapshot, ReservationError> {
    let raw: Option<serde_json::Value> =
        sqlx::query_scalar("SELECT metadata -> 'market_state' FROM global")
            .fetch_one(&mut **tx)
            .await
            .map_err(MetadataError::from)?;
    match raw {
        None | Some(serde_json::Value::Null) => Err(MetadataError::Internal(
            "no market snapshot recorded yet; reconcile must run before reservations open".into(),
        )
        .into()),
        Some(v) => Ok(serde_json::from_value(v).map_err(MetadataError::from)?),
    }
}

fn build_payload(
    piece: &PieceRow,
    client: &ClientRow,
    provider_id: i64,
    start_epoch: i64,
    end_epoch: i64,
) -> MetadataResult<DealProposal> {
    let cid: cid::Cid = piece
        .piece_cid
        .parse()
        .map_err(|e| MetadataError::Internal(format!("stored cid '{}': {e}", piece.piece_cid)))?;
    // aggregates are stored in v1 form; tolerate v2 for directly-claimed pieces
    let commp = CommP::from_pcid_v2(&cid)
        .or_else(|_| CommP::from_pcid_v1(&cid, piece.piece_log2_size as u8))?;

    let client_addr = match &client.client_robust {
        Some(s) => s
            .parse::<Address>()
            .map_err(|e| MetadataError::Internal(format!("client {} robust form: {e}", client.client_id)))?,
        None => Address::Id(client.client_id as u64),
    };

    Ok(DealProposal {
        piece_cid: commp.pcid_v1(),
        piece_size: commp.padded_size(),
        verified_deal: true,
        client: client_addr,
        provider: Address::Id(provider_id as u64),
        label: Label::Bytes(commp.pcid_v2().to_bytes()),
        start_epoch,
        end_epoch,
        storage_price_per_epoch: TokenAmount::zero(),
        provider_collateral: TokenAmount::zero(),
        client_collateral: TokenAmount::zero(),
    })
}
