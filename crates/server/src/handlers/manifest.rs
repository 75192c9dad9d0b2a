//! `/sp/piece_manifest`: segment listing for a reserved aggregate.

use crate::auth::{AuthedSp, RequestId};
use crate::error::{ApiError, ApiResult};
use crate::handlers::common::{ret_fail, ret_ok};
use crate::state::AppState;
use axum::extract::{Query, State};
use axum::response::Response;
use axum::Extension;
use serde::Deserialize;
use stevedore_core::api::{ApiErrorCode, PieceManifest, SegmentSource};
use stevedore_core::piece::CommP;
use uuid::Uuid;

/// Template placeholder substituted with each segment's v2 CID.
const SEGMENT_CID_PLACEHOLDER: &str = "{{pcid_v2}}";

#[derive(Debug, Deserialize)]
pub struct ManifestParams {
    proposal: Option<String>,
}

pub async fn piece_manifest(
    State(state): State<AppState>,
    Extension(sp): Extension<AuthedSp>,
    Extension(request_id): Extension<RequestId>,
    Query(params): Query<ManifestParams>,
) -> ApiResult<Response> {
    let Some(raw) = params.proposal else {
        return Ok(ret_fail(
            &state,
            &request_id,
            ApiErrorCode::InvalidRequest,
            vec!["A `proposal` UUID parameter must be supplied to this call".to_string()],
        )
        .await);
    };
    let proposal_uuid = match raw.parse::<Uuid>() {
        Ok(u) => u,
        Err(e) => {
            return Ok(ret_fail(
                &state,
                &request_id,
                ApiErrorCode::InvalidRequest,
                vec![format!(
                    "The supplied `proposal` parameter '{raw}' is not a valid UUID: {e}"
                )],
            )
            .await)
        }
    };

    let rows = state
        .store
        .segment_sources(proposal_uuid, sp.db_id())
        .await?;
    if rows.is_empty() {
        return Ok(ret_fail(
            &state,
            &request_id,
            ApiErrorCode::InvalidRequest,
            vec![format!(
                "no results for proposal UUID '{proposal_uuid}': either it does not exist, is too \
                 recent, does not belong to {} or is not segmented",
                sp.0
            )],
        )
        .await);
    }

    let template = rows[0].url_template.clone().ok_or_else(|| {
        ApiError::Internal("tenant publishes segments without a URL template".to_string())
    })?;

    let agg_cid: cid::Cid = rows[0]
        .agg_pcid_v1
        .parse()
        .map_err(|e| ApiError::Internal(format!("stored aggregate cid: {e}")))?;
    let agg_v2 = CommP::from_pcid_v1(&agg_cid, rows[0].agg_log2_size as u8)?
        .pcid_v2()
        .to_string();

    let piece_list: Vec<SegmentSource> = rows
        .into_iter()
        .map(|row| SegmentSource {
            sources: vec![template.replace(SEGMENT_CID_PLACEHOLDER, &row.seg_pcid_v2)],
            pcid_v2: row.seg_pcid_v2,
        })
        .collect();

    let entries = piece_list.len() as i64;
    let payload = PieceManifest {
        frc58_aggregate: agg_v2,
        piece_list,
    };
    Ok(ret_ok(&state, &request_id, payload, Vec::new(), Some(entries)).await)
}
