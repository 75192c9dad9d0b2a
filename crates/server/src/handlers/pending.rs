//! `/sp/pending_proposals`: outstanding reservations and recent failures.

use crate::auth::{AuthedSp, RequestId};
use crate::error::ApiResult;
use crate::handlers::common::{curl_for_sp, external_base, ret_ok};
use crate::state::AppState;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;
use axum::Extension;
use stevedore_core::address::ActorId;
use stevedore_core::api::{PendingProposal, PendingProposalsPayload, ProposalFailure};
use stevedore_core::epoch::epoch_to_time;
use time::OffsetDateTime;

/// How far back the failure feed reaches.
const FAILURE_WINDOW_HOURS: i64 = 24;

pub async fn pending_proposals(
    State(state): State<AppState>,
    Extension(sp): Extension<AuthedSp>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let now = OffsetDateTime::now_utc();
    let base = external_base(&headers);

    let pending = state.store.pending_for_provider(sp.db_id()).await?;
    let failures = state
        .store
        .recent_failures(sp.db_id(), now - time::Duration::hours(FAILURE_WINDOW_HOURS))
        .await?;

    let pending_proposals: Vec<PendingProposal> = pending
        .into_iter()
        .map(|row| {
            let start_time = epoch_to_time(row.start_epoch);
            let data_sources = if row.is_frc58_segmented {
                vec![curl_for_sp(
                    &base,
                    &sp,
                    "/sp/piece_manifest",
                    &[("proposal", row.proposal_uuid.to_string())],
                )]
            } else {
                Vec::new()
            };
            PendingProposal {
                deal_proposal_id: row.proposal_uuid,
                deal_proposal_cid: row.proposal_meta.0.signed_proposal_cid.clone(),
                hours_remaining: (start_time - now).whole_hours(),
                piece_size: 1i64 << row.piece_log2_size,
                piece_cid: row.piece_cid.clone(),
                tenant_id: row.tenant_id,
                tenant_client_id: client_display(&row.client_robust, row.client_id),
                deal_start_time: start_time,
                deal_start_epoch: row.start_epoch,
                sample_import_cmd: format!(
                    "boostd import-data {} /path/to/{}.car",
                    row.proposal_uuid, row.piece_cid
                ),
                data_sources,
            }
        })
        .collect();

    let recent_failures: Vec<ProposalFailure> = failures
        .into_iter()
        .map(|row| ProposalFailure {
            error_timestamp: row.failed_at,
            error: row
                .proposal_meta
                .0
                .failure
                .clone()
                .unwrap_or_else(|| "unrecorded failure".to_string()),
            piece_cid: row.piece_cid,
            proposal_id: row.proposal_uuid,
            proposal_cid: row.proposal_meta.0.signed_proposal_cid.clone(),
            tenant_id: row.tenant_id,
            tenant_client_id: client_display(&row.client_robust, row.client_id),
        })
        .collect();

    let entries = pending_proposals.len() as i64;
    let payload = PendingProposalsPayload {
        recent_failures,
        pending_proposals,
    };
    Ok(ret_ok(&state, &request_id, payload, Vec::new(), Some(entries)).await)
}

fn client_display(robust: &Option<String>, client_id: i64) -> String {
    robust
        .clone()
        .unwrap_or_else(|| ActorId(client_id as u64).to_string())
}
