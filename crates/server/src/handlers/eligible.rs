//! `/sp/eligible_pieces`: the near-real-time "what can I reserve right now"
//! listing.

use crate::auth::{AuthedSp, RequestId};
use crate::error::ApiResult;
use crate::handlers::common::{curl_for_sp, external_base, ret_fail, ret_ok};
use crate::state::AppState;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::Extension;
use serde::Deserialize;
use std::collections::HashMap;
use stevedore_core::api::{ApiErrorCode, EligiblePiece};
use stevedore_core::{LIST_ELIGIBLE_DEFAULT_SIZE, LIST_ELIGIBLE_MAX_SIZE};

#[derive(Debug, Deserialize, Default)]
pub struct EligibleParams {
    limit: Option<String>,
    tenant: Option<String>,
    #[serde(rename = "include-sourceless")]
    include_sourceless: Option<String>,
    /// Tuning knob: force the materialized cross-product strategy.
    #[serde(rename = "internal-nolateral")]
    internal_nolateral: Option<String>,
}

pub(crate) fn truthy(v: &Option<String>) -> bool {
    matches!(
        v.as_deref().map(str::to_ascii_lowercase).as_deref(),
        Some("1") | Some("true") | Some("yes") | Some("y") | Some("")
    )
}

pub async fn eligible_pieces(
    State(state): State<AppState>,
    Extension(sp): Extension<AuthedSp>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    Query(params): Query<EligibleParams>,
) -> ApiResult<Response> {
    let limit = match &params.limit {
        None => LIST_ELIGIBLE_DEFAULT_SIZE,
        Some(raw) => match raw.parse::<u64>() {
            Ok(n) if (1..=LIST_ELIGIBLE_MAX_SIZE).contains(&n) => n,
            _ => {
                return Ok(ret_fail(
                    &state,
                    &request_id,
                    ApiErrorCode::InvalidRequest,
                    vec![format!(
                        "provided limit '{raw}' is not an integer between 1 and {LIST_ELIGIBLE_MAX_SIZE}"
                    )],
                )
                .await)
            }
        },
    };

    let tenant_id = match &params.tenant {
        None => 0i16,
        Some(raw) => match raw.parse::<i16>() {
            Ok(t) if t >= 1 => t,
            _ => {
                return Ok(ret_fail(
                    &state,
                    &request_id,
                    ApiErrorCode::InvalidRequest,
                    vec![format!("provided tenant '{raw}' is not a positive integer")],
                )
                .await)
            }
        },
    };

    // Start small by default; flip to the materialized cross-product when
    // the caller wants a deep listing or asks for it explicitly.
    let full = if params.internal_nolateral.is_some() {
        truthy(&params.internal_nolateral)
    } else {
        limit > LIST_ELIGIBLE_DEFAULT_SIZE
    };

    // One extra row disambiguates "there is more".
    let mut rows = state
        .store
        .eligible_pieces(
            sp.db_id(),
            (limit + 1) as i64,
            tenant_id,
            truthy(&params.include_sourceless),
            full,
        )
        .await?;

    let base = external_base(&headers);
    let mut info = vec![
        "List of qualifying Piece CIDs.".to_string(),
        String::new(),
        "Once you have selected a Piece CID - reserve it in the system by invoking the API as"
            .to_string(),
        "shown in the corresponding `sample_reserve_cmd`. Within 5 minutes the reservation"
            .to_string(),
        "will activate and you will be able to see it and potential unlocked sources at:"
            .to_string(),
        format!(" {}", curl_for_sp(&base, &sp, "/sp/pending_proposals", &[])),
    ];

    if rows.len() as u64 > limit {
        rows.truncate(limit as usize);
        let expanded = (2 * limit.max(LIST_ELIGIBLE_DEFAULT_SIZE)) / 100 * 100;
        let mut note = vec![
            format!("NOTE: The complete list of entries has been TRUNCATED to the top {limit}."),
            "Use the 'limit' param in your API call to request more of the (possibly very large) list:"
                .to_string(),
            format!(
                " {}",
                curl_for_sp(
                    &base,
                    &sp,
                    "/sp/eligible_pieces",
                    &[("limit", expanded.to_string())],
                )
            ),
            String::new(),
        ];
        note.append(&mut info);
        info = note;
    }

    let policies: HashMap<i16, String> = state
        .store
        .list_tenants()
        .await?
        .into_iter()
        .map(|t| (t.tenant_id, t.tenant_policy_cid))
        .collect();

    let entries = rows.len() as i64;
    let payload: Vec<EligiblePiece> = rows
        .into_iter()
        .map(|row| {
            let tenant = row.tenant_ids.first().copied().unwrap_or_default();
            let policy = policies.get(&tenant).cloned().unwrap_or_default();
            let sample = curl_for_sp(
                &base,
                &sp,
                "/sp/invoke",
                &[
                    ("call", "reserve_piece".to_string()),
                    ("piece_cid", row.piece_cid.clone()),
                    ("tenant_policy", policy.clone()),
                ],
            );
            EligiblePiece {
                piece_cid: row.piece_cid,
                padded_piece_size: 1u64 << row.piece_log2_size,
                tenant_id: tenant,
                tenant_policy_cid: policy,
                sample_reserve_cmd: sample,
            }
        })
        .collect();

    Ok(ret_ok(&state, &request_id, payload, info, Some(entries)).await)
}
