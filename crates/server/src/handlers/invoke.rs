//! `/sp/invoke`: the sole mutating call.

use crate::auth::{AuthedSp, RequestId};
use crate::error::{ApiError, ApiResult};
use crate::handlers::common::{ret_fail, ret_ok};
use crate::state::AppState;
use axum::extract::{Query, State};
use axum::response::Response;
use axum::Extension;
use serde::Deserialize;
use stevedore_core::api::{ApiErrorCode, DealRequestResponse, TenantReplicationState};
use stevedore_metadata::ReservationError;

#[derive(Debug, Deserialize)]
pub struct InvokeParams {
    call: Option<String>,
    piece_cid: Option<String>,
    tenant_policy: Option<String>,
}

pub async fn invoke(
    State(state): State<AppState>,
    Extension(sp): Extension<AuthedSp>,
    Extension(request_id): Extension<RequestId>,
    Query(params): Query<InvokeParams>,
) -> ApiResult<Response> {
    match params.call.as_deref() {
        Some("reserve_piece") => {}
        other => {
            return Ok(ret_fail(
                &state,
                &request_id,
                ApiErrorCode::InvalidRequest,
                vec![format!(
                    "unrecognized invocation '{}'; the only supported call is 'reserve_piece'",
                    other.unwrap_or_default()
                )],
            )
            .await)
        }
    }

    let Some(piece_cid) = params.piece_cid.filter(|c| !c.is_empty()) else {
        return Ok(ret_fail(
            &state,
            &request_id,
            ApiErrorCode::InvalidRequest,
            vec!["a `piece_cid` parameter is required".to_string()],
        )
        .await);
    };
    let Some(policy) = params.tenant_policy.filter(|p| !p.is_empty()) else {
        return Ok(ret_fail(
            &state,
            &request_id,
            ApiErrorCode::InvalidRequest,
            vec!["a `tenant_policy` parameter is required".to_string()],
        )
        .await);
    };

    let Some(tenant) = state.store.tenant_by_policy(&policy).await? else {
        return Ok(ret_fail(
            &state,
            &request_id,
            ApiErrorCode::InvalidRequest,
            vec![format!("unknown tenant_policy '{policy}'")],
        )
        .await);
    };

    match state
        .store
        .reserve_piece(sp.db_id(), &piece_cid, &tenant)
        .await
    {
        Ok(outcome) => {
            let states = state
                .store
                .replication_states(sp.db_id(), outcome.piece_id)
                .await?;
            let payload = DealRequestResponse {
                tenant_replication_states: states
                    .into_iter()
                    .map(to_replication_state)
                    .collect(),
                deal_start_time: Some(outcome.start_time),
                deal_start_epoch: Some(outcome.start_epoch),
            };
            let info = vec![format!(
                "reservation {} accepted; a signed proposal will be delivered to your market \
                 node by the next delivery run",
                outcome.proposal_uuid
            )];
            Ok(ret_ok(&state, &request_id, payload, info, None).await)
        }
        Err(ReservationError::Denied(denial)) => Ok(ret_fail(
            &state,
            &request_id,
            denial.api_code(),
            vec![denial.to_string()],
        )
        .await),
        Err(ReservationError::Store(e)) => Err(ApiError::Metadata(e)),
    }
}

fn to_replication_state(
    row: stevedore_metadata::models::ReplicationStateRow,
) -> TenantReplicationState {
    TenantReplicationState {
        tenant_id: row.tenant_id,
        tenant_client_id: row.client_robust,
        tenant_max_in_flight_bytes: row.max_in_flight_bytes,
        sp_in_flight_bytes: row.cur_in_flight_bytes,
        tenant_max_total: row.max_total,
        tenant_max_per_org: row.max_per_org,
        tenant_max_per_metro: row.max_per_city,
        tenant_max_per_country: row.max_per_country,
        tenant_max_per_continent: row.max_per_continent,
        total: row.cur_total,
        in_org: row.cur_in_org,
        in_metro: row.cur_in_city,
        in_country: row.cur_in_country,
        in_continent: row.cur_in_continent,
        deal_already_exists: row.deal_already_exists,
    }
}

/// Catch-all for unknown routes and the GET form of `/sp/invoke`.
pub async fn invalid_route(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    _sp: Option<Extension<AuthedSp>>,
) -> Response {
    let request_id = request_id
        .map(|Extension(r)| r)
        .unwrap_or_else(|| RequestId(uuid::Uuid::new_v4().to_string()));
    ret_fail(
        &state,
        &request_id,
        ApiErrorCode::InvalidRequest,
        vec!["this route/method combination is not recognized".to_string()],
    )
    .await
}
