//! API error plumbing.
//!
//! Policy denials and request errors are rendered as envelope failures by
//! the handlers themselves (they know the request context); this type only
//! carries infrastructure failures that bubble out through `?`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use stevedore_core::api::ResponseEnvelope;
use time::OffsetDateTime;

/// Infrastructure-level API failure.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("metadata error: {0}")]
    Metadata(#[from] stevedore_metadata::MetadataError),

    #[error("core error: {0}")]
    Core(#[from] stevedore_core::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::error!(error = %self, "request failed");
        let env = ResponseEnvelope {
            request_id: None,
            response_timestamp: OffsetDateTime::now_utc(),
            response_state_epoch: None,
            response_code: StatusCode::INTERNAL_SERVER_ERROR.as_u16() as i32,
            error_code: None,
            error_slug: None,
            error_lines: Some(vec![self.to_string()]),
            info_lines: None,
            response_entries: None,
            response: serde_json::Value::Null,
        };
        (StatusCode::INTERNAL_SERVER_ERROR, Json(env)).into_response()
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;
