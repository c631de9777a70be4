//! Bearer-token authentication middleware.
//!
//! When the core is configured with an API key (`ACE_API_KEY`), every
//! request must carry `Authorization: Bearer <key>`. Without a configured
//! key the middleware passes everything through, which is the in-process
//! and test composition.

use ace_core::CoreError;
use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};

use crate::api::ApiState;
use crate::error::ApiError;

pub async fn require_api_key(
    State(state): State<ApiState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = &state.api_key else {
        return Ok(next.run(request).await);
    };

    let header_value = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| {
            ApiError(CoreError::Unauthorized {
                reason: "missing Authorization header".to_string(),
            })
        })?;

    let token = header_value.strip_prefix("Bearer ").ok_or_else(|| {
        ApiError(CoreError::Unauthorized {
            reason: "Authorization header is not a bearer token".to_string(),
        })
    })?;

    if token != expected {
        return Err(ApiError(CoreError::Unauthorized {
            reason: "invalid API key".to_string(),
        }));
    }

    Ok(next.run(request).await)
}
