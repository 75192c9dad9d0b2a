//! Typed views of the JSONB meta columns.
//!
//! Each meta blob is a typed record for the fields the broker itself reads
//! and writes, plus a flattened opaque bag so operator-added keys survive
//! round-trips untouched.

use crate::deal::{DealProposal, Signature};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

/// `proposals.proposal_meta`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProposalMeta {
    /// The unsigned market payload, written at reservation time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filmarket_proposal: Option<DealProposal>,
    /// Client signature, written by the signing stage.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<Signature>,
    /// CID of the signed proposal, written by the signing stage.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signed_proposal_cid: Option<String>,
    /// Terminal failure message, if the proposal is failstamped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    /// One sample per delivery attempt, newest last.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub delivery_timings: Vec<TimingSample>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Wall-time record of one delivery RPC attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingSample {
    #[serde(with = "time::serde::rfc3339")]
    pub attempted_at: OffsetDateTime,
    pub took_msecs: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_peer_id: Option<String>,
}

/// `pieces.piece_meta`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PieceMeta {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_frc58_segmented: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub size_proven_correct: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `tenants.tenant_meta`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TenantMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bulk_piece_source: Option<BulkPieceSource>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Descriptor of a tenant's bulk manifest feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkPieceSource {
    #[serde(rename = "type")]
    pub source_type: String,
    /// Shared credentials profile name.
    pub config: String,
    /// Region followed by bucket, matching the original descriptor layout.
    pub path_parts: Vec<String>,
    /// Template rendered per segment to produce retrieval URLs.
    pub url_template: String,
    #[serde(default)]
    pub is_frc58: bool,
}

/// `clients.client_meta`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientMeta {
    /// Projected datacap: chain-reported balance plus everything published
    /// but not yet activated. Maintained by the reconciler.
    #[serde(default)]
    pub activatable_datacap: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `published_deals.published_deal_meta`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DealMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub termination_reason: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proposal_meta_preserves_unknown_keys() {
        let raw = serde_json::json!({
            "failure": "sector containing deal was terminated",
            "operator_note": "manually inspected 2024-11-02"
        });
        let meta: ProposalMeta = serde_json::from_value(raw).unwrap();
        assert_eq!(
            meta.failure.as_deref(),
            Some("sector containing deal was terminated")
        );
        let back = serde_json::to_value(&meta).unwrap();
        assert_eq!(back["operator_note"], "manually inspected 2024-11-02");
    }

    #[test]
    fn piece_meta_default_is_empty_object() {
        let v = serde_json::to_value(PieceMeta::default()).unwrap();
        assert_eq!(v, serde_json::json!({}));
    }

    #[test]
    fn bulk_piece_source_wire_shape() {
        let raw = serde_json::json!({
            "type": "s3",
            "config": "tenant-13",
            "path_parts": ["us-east-2", "manifests-prod"],
            "url_template": "https://data.example.org/{{pcid_v2}}",
            "is_frc58": true
        });
        let src: BulkPieceSource = serde_json::from_value(raw).unwrap();
        assert_eq!(src.source_type, "s3");
        assert_eq!(src.path_parts[1], "manifests-prod");
        assert!(src.is_frc58);
    }
}
