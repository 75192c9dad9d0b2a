//! Authenticated-caller extraction.
//!
//! Authentication itself (signature challenge, token checks) lives in the
//! fronting proxy; by the time a request reaches this app it carries the
//! verified SP actor id in a trusted header. This middleware lifts that id
//! plus the request correlation id into extensions.

use crate::state::AppState;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use stevedore_core::address::ActorId;
use stevedore_core::api::{ApiErrorCode, ResponseEnvelope};
use time::OffsetDateTime;
use uuid::Uuid;

/// Header carrying the upstream-verified SP actor id.
pub const AUTHED_ACTOR_HEADER: &str = "x-authenticated-actor";

/// Header carrying the caller-supplied request correlation id.
pub const REQUEST_UUID_HEADER: &str = "x-request-uuid";

/// The authenticated SP, available to every handler.
#[derive(Clone, Copy, Debug)]
pub struct AuthedSp(pub ActorId);

impl AuthedSp {
    /// Actor id in database form.
    pub fn db_id(&self) -> i64 {
        self.0 .0 as i64
    }
}

/// Request correlation id, echoed back in the envelope.
#[derive(Clone, Debug)]
pub struct RequestId(pub String);

/// Reject requests without a verified actor id; everything on `/sp` is
/// per-SP scoped.
pub async fn auth_middleware(
    State(_state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    let request_id = req
        .headers()
        .get(REQUEST_UUID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let actor = req
        .headers()
        .get(AUTHED_ACTOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_actor);

    let Some(actor) = actor else {
        let code = ApiErrorCode::UnauthorizedAccess;
        let env = ResponseEnvelope {
            request_id: Some(request_id),
            response_timestamp: OffsetDateTime::now_utc(),
            response_state_epoch: None,
            response_code: code.http_status() as i32,
            error_code: Some(code.code()),
            error_slug: Some(code.slug().to_string()),
            error_lines: Some(vec![
                "no authenticated storage-provider identity attached to this request".to_string(),
            ]),
            info_lines: None,
            response_entries: None,
            response: serde_json::Value::Null,
        };
        return (StatusCode::UNAUTHORIZED, Json(env)).into_response();
    };

    req.extensions_mut().insert(AuthedSp(actor));
    req.extensions_mut().insert(RequestId(request_id));
    next.run(req).await
}

/// Accept both the `f0...` address form and a bare actor number.
fn parse_actor(s: &str) -> Option<ActorId> {
    if let Ok(id) = s.parse::<ActorId>() {
        return Some(id);
    }
    s.parse::<u64>().ok().map(ActorId)
}
