//! Shared envelope builders and request helpers.

use crate::auth::{AuthedSp, RequestId};
use crate::state::AppState;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use stevedore_core::api::{ApiErrorCode, ResponseEnvelope};
use time::OffsetDateTime;

/// Build the success envelope around a payload.
pub async fn ret_ok<T: Serialize>(
    state: &AppState,
    request_id: &RequestId,
    payload: T,
    info_lines: Vec<String>,
    entries: Option<i64>,
) -> Response {
    let env = ResponseEnvelope {
        request_id: Some(request_id.0.clone()),
        response_timestamp: OffsetDateTime::now_utc(),
        response_state_epoch: state.state_epoch().await,
        response_code: 200,
        error_code: None,
        error_slug: None,
        error_lines: None,
        info_lines: (!info_lines.is_empty()).then_some(info_lines),
        response_entries: entries,
        response: payload,
    };
    (StatusCode::OK, Json(env)).into_response()
}

/// Build the failure envelope for a coded error.
pub async fn ret_fail(
    state: &AppState,
    request_id: &RequestId,
    code: ApiErrorCode,
    error_lines: Vec<String>,
) -> Response {
    let http = StatusCode::from_u16(code.http_status()).expect("status table is valid");
    let env = ResponseEnvelope {
        request_id: Some(request_id.0.clone()),
        response_timestamp: OffsetDateTime::now_utc(),
        response_state_epoch: state.state_epoch().await,
        response_code: http.as_u16() as i32,
        error_code: Some(code.code()),
        error_slug: Some(code.slug().to_string()),
        error_lines: Some(error_lines),
        info_lines: None,
        response_entries: None,
        response: serde_json::Value::Null,
    };
    (http, Json(env)).into_response()
}

/// The externally-visible base URL for sample commands, best-effort from
/// the Host header.
pub fn external_base(headers: &HeaderMap) -> String {
    let host = headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost:8080");
    format!("https://{host}")
}

/// Render an authenticated sample curl invocation for the SP.
pub fn curl_for_sp(base: &str, sp: &AuthedSp, path: &str, query: &[(&str, String)]) -> String {
    let mut url = format!("{base}{path}");
    if !query.is_empty() {
        let qs: Vec<String> = query
            .iter()
            .map(|(k, v)| format!("{k}={}", urlencode(v)))
            .collect();
        url.push('?');
        url.push_str(&qs.join("&"));
    }
    format!(
        "curl -sLH \"Authorization: $(./fil-spid.bash {})\" '{url}'",
        sp.0
    )
}

fn urlencode(v: &str) -> String {
    let mut out = String::with_capacity(v.len());
    for b in v.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use stevedore_core::address::ActorId;

    #[test]
    fn sample_curl_shape() {
        let sp = AuthedSp(ActorId(2020));
        let cmd = curl_for_sp(
            "https://broker.example.org",
            &sp,
            "/sp/invoke",
            &[
                ("call", "reserve_piece".to_string()),
                ("piece_cid", "baga6ea4seaq/odd".to_string()),
            ],
        );
        assert!(cmd.contains("f02020"));
        assert!(cmd.contains("/sp/invoke?call=reserve_piece&piece_cid=baga6ea4seaq%2Fodd"));
    }
}
