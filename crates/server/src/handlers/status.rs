//! `/sp/status` placeholder.

use crate::auth::{AuthedSp, RequestId};
use crate::handlers::common::ret_fail;
use crate::state::AppState;
use axum::extract::State;
use axum::response::Response;
use axum::Extension;
use stevedore_core::api::ApiErrorCode;

/// Never implemented upstream either; reserved for a future system/SP
/// status report.
pub async fn sp_status(
    State(state): State<AppState>,
    Extension(sp): Extension<AuthedSp>,
    Extension(request_id): Extension<RequestId>,
) -> Response {
    ret_fail(
        &state,
        &request_id,
        ApiErrorCode::SystemTemporarilyDisabled,
        vec![format!(
            "This area will contain various information regarding the system and the current \
             state of storage provider {}",
            sp.0
        )],
    )
    .await
}
