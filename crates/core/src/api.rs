//! Public API surface types: the response envelope wrapping every endpoint,
//! its payloads, and the error-code table.
//!
//! Field names here are wire contract; renames are breaking changes for
//! every SP-side tool that parses the envelope.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Error codes carried in the envelope's `error_code` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ApiErrorCode {
    // Common
    InvalidRequest = 4400,
    UnauthorizedAccess = 4401,
    SystemTemporarilyDisabled = 4503,

    // SP reservation specific
    OversizedPiece = 4011,
    StorageProviderSuspended = 4012,
    StorageProviderIneligibleToMine = 4013,

    StorageProviderInfoTooOld = 4041,
    StorageProviderUndialable = 4042,
    StorageProviderUnsupported = 4043,

    UnclaimedPieceCid = 4020,
    ProviderHasReplica = 4021,
    TenantsOutOfDatacap = 4022,
    TooManyReplicas = 4023,
    ProviderAboveMaxInFlight = 4024,
    /// Catch-all for when competing tenants share no single rejection theme.
    ReplicationRulesViolation = 4029,

    /// Some tenants run an additional acceptance check on their end.
    ExternalReservationRefused = 4030,
}

impl ApiErrorCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn slug(self) -> &'static str {
        match self {
            Self::InvalidRequest => "ErrInvalidRequest",
            Self::UnauthorizedAccess => "ErrUnauthorizedAccess",
            Self::SystemTemporarilyDisabled => "ErrSystemTemporarilyDisabled",
            Self::OversizedPiece => "ErrOversizedPiece",
            Self::StorageProviderSuspended => "ErrStorageProviderSuspended",
            Self::StorageProviderIneligibleToMine => "ErrStorageProviderIneligibleToMine",
            Self::StorageProviderInfoTooOld => "ErrStorageProviderInfoTooOld",
            Self::StorageProviderUndialable => "ErrStorageProviderUndialable",
            Self::StorageProviderUnsupported => "ErrStorageProviderUnsupported",
            Self::UnclaimedPieceCid => "ErrUnclaimedPieceCID",
            Self::ProviderHasReplica => "ErrProviderHasReplica",
            Self::TenantsOutOfDatacap => "ErrTenantsOutOfDatacap",
            Self::TooManyReplicas => "ErrTooManyReplicas",
            Self::ProviderAboveMaxInFlight => "ErrProviderAboveMaxInFlight",
            Self::ReplicationRulesViolation => "ErrReplicationRulesViolation",
            Self::ExternalReservationRefused => "ErrExternalReservationRefused",
        }
    }

    /// HTTP status the edge maps this code to. Admissibility denials are
    /// authorization failures from the SP's point of view.
    pub fn http_status(self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::UnauthorizedAccess => 401,
            Self::SystemTemporarilyDisabled => 503,
            _ => 403,
        }
    }
}

/// The structure wrapping all responses from the deal engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope<T> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub response_timestamp: OffsetDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_state_epoch: Option<i64>,
    pub response_code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_slug: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_lines: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info_lines: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_entries: Option<i64>,
    pub response: T,
}

/// One entry of the `/sp/eligible_pieces` listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EligiblePiece {
    pub piece_cid: String,
    pub padded_piece_size: u64,
    pub tenant_id: i16,
    pub tenant_policy_cid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sample_reserve_cmd: String,
}

/// Per-tenant replication-state vector returned on reservation calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantReplicationState {
    pub tenant_id: i16,
    pub tenant_client_id: Option<String>,

    pub tenant_max_in_flight_bytes: i64,
    #[serde(rename = "actual_in_flight_bytes")]
    pub sp_in_flight_bytes: i64,

    pub tenant_max_total: i16,
    pub tenant_max_per_org: i16,
    pub tenant_max_per_metro: i16,
    pub tenant_max_per_country: i16,
    pub tenant_max_per_continent: i16,

    #[serde(rename = "actual_total")]
    pub total: i16,
    #[serde(rename = "actual_within_org")]
    pub in_org: i16,
    #[serde(rename = "actual_within_metro")]
    pub in_metro: i16,
    #[serde(rename = "actual_within_country")]
    pub in_country: i16,
    #[serde(rename = "actual_within_continent")]
    pub in_continent: i16,

    #[serde(rename = "sp_holds_qualifying_deal")]
    pub deal_already_exists: bool,
}

/// Payload of a successful `reserve_piece` invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DealRequestResponse {
    pub tenant_replication_states: Vec<TenantReplicationState>,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub deal_start_time: Option<OffsetDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deal_start_epoch: Option<i64>,
}

/// One outstanding proposal, as listed by `/sp/pending_proposals`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingProposal {
    pub deal_proposal_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deal_proposal_cid: Option<String>,
    pub hours_remaining: i64,
    pub piece_size: i64,
    pub piece_cid: String,
    pub tenant_id: i16,
    pub tenant_client_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub deal_start_time: OffsetDateTime,
    pub deal_start_epoch: i64,
    pub sample_import_cmd: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data_sources: Vec<String>,
}

/// A recently failstamped proposal, surfaced to the SP for diagnosis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalFailure {
    #[serde(rename = "timestamp", with = "time::serde::rfc3339")]
    pub error_timestamp: OffsetDateTime,
    pub error: String,
    pub piece_cid: String,
    #[serde(rename = "deal_proposal_id")]
    pub proposal_id: Uuid,
    #[serde(rename = "deal_proposal_cid", skip_serializing_if = "Option::is_none")]
    pub proposal_cid: Option<String>,
    pub tenant_id: i16,
    pub tenant_client_id: String,
}

/// Payload of `/sp/pending_proposals`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingProposalsPayload {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recent_failures: Vec<ProposalFailure>,
    pub pending_proposals: Vec<PendingProposal>,
}

/// Payload of `/sp/piece_manifest` for a segmented aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PieceManifest {
    pub frc58_aggregate: String,
    pub piece_list: Vec<SegmentSource>,
}

/// One aggregate segment with its retrieval sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentSource {
    pub pcid_v2: String,
    pub sources: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_integer_table() {
        assert_eq!(ApiErrorCode::InvalidRequest.code(), 4400);
        assert_eq!(ApiErrorCode::UnauthorizedAccess.code(), 4401);
        assert_eq!(ApiErrorCode::SystemTemporarilyDisabled.code(), 4503);
        assert_eq!(ApiErrorCode::OversizedPiece.code(), 4011);
        assert_eq!(ApiErrorCode::StorageProviderSuspended.code(), 4012);
        assert_eq!(ApiErrorCode::StorageProviderIneligibleToMine.code(), 4013);
        assert_eq!(ApiErrorCode::StorageProviderInfoTooOld.code(), 4041);
        assert_eq!(ApiErrorCode::StorageProviderUndialable.code(), 4042);
        assert_eq!(ApiErrorCode::StorageProviderUnsupported.code(), 4043);
        assert_eq!(ApiErrorCode::UnclaimedPieceCid.code(), 4020);
        assert_eq!(ApiErrorCode::ProviderHasReplica.code(), 4021);
        assert_eq!(ApiErrorCode::TenantsOutOfDatacap.code(), 4022);
        assert_eq!(ApiErrorCode::TooManyReplicas.code(), 4023);
        assert_eq!(ApiErrorCode::ProviderAboveMaxInFlight.code(), 4024);
        assert_eq!(ApiErrorCode::ReplicationRulesViolation.code(), 4029);
        assert_eq!(ApiErrorCode::ExternalReservationRefused.code(), 4030);
    }

    #[test]
    fn http_status_mapping() {
        assert_eq!(ApiErrorCode::InvalidRequest.http_status(), 400);
        assert_eq!(ApiErrorCode::UnauthorizedAccess.http_status(), 401);
        assert_eq!(ApiErrorCode::SystemTemporarilyDisabled.http_status(), 503);
        assert_eq!(ApiErrorCode::ProviderHasReplica.http_status(), 403);
        assert_eq!(ApiErrorCode::TenantsOutOfDatacap.http_status(), 403);
    }

    #[test]
    fn envelope_omits_empty_fields() {
        let env = ResponseEnvelope {
            request_id: None,
            response_timestamp: OffsetDateTime::UNIX_EPOCH,
            response_state_epoch: None,
            response_code: 200,
            error_code: None,
            error_slug: None,
            error_lines: None,
            info_lines: None,
            response_entries: None,
            response: serde_json::json!([]),
        };
        let text = serde_json::to_string(&env).unwrap();
        assert!(!text.contains("error_code"));
        assert!(!text.contains("request_id"));
        assert!(text.contains("\"response\":[]"));
    }

    #[test]
    fn replication_state_wire_names() {
        let st = TenantReplicationState {
            tenant_id: 13,
            tenant_client_id: Some("f01234".into()),
            tenant_max_in_flight_bytes: 1 << 40,
            sp_in_flight_bytes: 0,
            tenant_max_total: 10,
            tenant_max_per_org: 2,
            tenant_max_per_metro: 2,
            tenant_max_per_country: 3,
            tenant_max_per_continent: 4,
            total: 1,
            in_org: 0,
            in_metro: 0,
            in_country: 1,
            in_continent: 1,
            deal_already_exists: false,
        };
        let v: serde_json::Value = serde_json::to_value(&st).unwrap();
        assert_eq!(v["actual_in_flight_bytes"], 0);
        assert_eq!(v["tenant_max_per_metro"], 2);
        assert_eq!(v["actual_within_continent"], 1);
        assert_eq!(v["sp_holds_qualifying_deal"], false);
    }
}
