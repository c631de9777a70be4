//! HTTP surface mirroring the core API.
//!
//! Each endpoint corresponds one-to-one with a core operation; semantics
//! are identical to calling the core locally. Entities cross the wire as
//! snake_case JSON carrying blob handles, never blob bodies — blobs move
//! out-of-band through `/blob`.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::sse::{Event as SseEvent, KeepAlive};
use axum::response::{IntoResponse, Json, Response, Sse};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

use ace_core::{
    AnalysisModuleType, AnalysisRequest, CoreError, CoreSystem, RootAnalysis,
};

use crate::auth::require_api_key;
use crate::error::ApiError;

/// Shared handler state: one core instance plus the configured API key.
#[derive(Clone)]
pub struct ApiState {
    pub core: Arc<CoreSystem>,
    pub api_key: Option<String>,
}

impl ApiState {
    #[must_use]
    pub fn new(core: Arc<CoreSystem>) -> Self {
        let api_key = core.config().api_key.clone();
        Self { core, api_key }
    }
}

/// Build the full router with authentication applied.
#[must_use]
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/analysis/root", post(submit_root))
        .route("/analysis/root/{uuid}", get(get_root).delete(delete_root))
        .route("/analysis/result", post(post_result))
        .route("/module/type", post(register_module_type))
        .route(
            "/module/type/{name}",
            get(get_module_type).delete(delete_module_type),
        )
        .route("/work/{amt_name}", get(get_work))
        .route("/work/{id}/ack", post(ack_work))
        .route("/blob", post(upload_blob))
        .route("/blob/{sha256}", get(download_blob))
        .route("/events", get(stream_events))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

async fn submit_root(
    State(state): State<ApiState>,
    Json(root): Json<RootAnalysis>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let uuid = state.core.submit(root).await?;
    Ok(Json(json!({ "uuid": uuid })))
}

async fn get_root(
    State(state): State<ApiState>,
    Path(uuid): Path<Uuid>,
) -> Result<Json<RootAnalysis>, ApiError> {
    state
        .core
        .get_root(&uuid)
        .map(Json)
        .ok_or_else(|| ApiError(CoreError::not_found("root_analysis", uuid.to_string())))
}

async fn delete_root(
    State(state): State<ApiState>,
    Path(uuid): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let deleted = state.core.delete_root(&uuid);
    Ok(Json(json!({ "deleted": deleted })))
}

async fn post_result(
    State(state): State<ApiState>,
    Json(request): Json<AnalysisRequest>,
) -> Result<StatusCode, ApiError> {
    state.core.post_result(request).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn register_module_type(
    State(state): State<ApiState>,
    Json(amt): Json<AnalysisModuleType>,
) -> Result<Json<AnalysisModuleType>, ApiError> {
    Ok(Json(state.core.register_analysis_module_type(amt)?))
}

async fn get_module_type(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<Json<AnalysisModuleType>, ApiError> {
    state
        .core
        .get_analysis_module_type(&name)
        .map(Json)
        .ok_or_else(|| ApiError(CoreError::not_found("analysis_module_type", name)))
}

async fn delete_module_type(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let deleted = state.core.delete_analysis_module_type(&name);
    Ok(Json(json!({ "deleted": deleted })))
}

#[derive(Debug, Deserialize)]
struct WorkQuery {
    owner: String,
    version: String,
    #[serde(default)]
    wait_secs: u64,
}

async fn get_work(
    State(state): State<ApiState>,
    Path(amt_name): Path<String>,
    Query(query): Query<WorkQuery>,
) -> Result<Response, ApiError> {
    let leased = state
        .core
        .get_next_analysis_request(
            &query.owner,
            &amt_name,
            &query.version,
            Duration::from_secs(query.wait_secs),
        )
        .await?;

    match leased {
        Some(request) => Ok(Json(request).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

async fn ack_work(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let acked = state.core.ack_analysis_request(id)?;
    Ok(Json(json!({ "acked": acked })))
}

async fn upload_blob(
    State(state): State<ApiState>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let sha256 = state.core.store_blob(&body)?;
    Ok(Json(json!({ "sha256": sha256 })))
}

async fn download_blob(
    State(state): State<ApiState>,
    Path(sha256): Path<String>,
) -> Result<Response, ApiError> {
    match state.core.load_blob(&sha256)? {
        Some(bytes) => Ok(bytes.into_response()),
        None => Err(ApiError(CoreError::not_found("blob", sha256))),
    }
}

#[derive(Debug, Deserialize)]
struct EventQuery {
    topic: String,
}

/// Long-lived SSE stream of one event topic. Lagging subscribers lose
/// events rather than backpressuring the core.
async fn stream_events(
    State(state): State<ApiState>,
    Query(query): Query<EventQuery>,
) -> Sse<impl tokio_stream::Stream<Item = Result<SseEvent, std::convert::Infallible>>> {
    let receiver = state.core.subscribe(&query.topic);

    let stream = BroadcastStream::new(receiver).filter_map(|event| match event {
        Ok(event) => serde_json::to_string(&event)
            .ok()
            .map(|data| Ok(SseEvent::default().data(data))),
        Err(BroadcastStreamRecvError::Lagged(_)) => None,
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
