//! Wire error mapping for the HTTP facade.

use ace_core::CoreError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;

/// Error wrapper giving every [`CoreError`] a canonical HTTP shape:
/// `{"error": "<kind>", "message": "<detail>"}`.
#[derive(Debug)]
pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            CoreError::Conflict { .. } | CoreError::Deadlock { .. } => StatusCode::CONFLICT,
            CoreError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            CoreError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            CoreError::ValidationFailed { .. } => StatusCode::BAD_REQUEST,
            CoreError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::Fatal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": self.0.wire_kind(),
            "message": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}
