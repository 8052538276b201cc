//! HTTP surface
//!
//! ## Routes
//!
//! - `POST /media` - raw body upload; `?stages=`, `?format=`, `?filename=`
//! - `GET /artifacts/{id}` - committed artifact bytes
//! - `GET /health` - liveness plus slot usage of the answering worker
//! - `GET /metrics` - counters of the answering worker
//! - `GET /capabilities` - service card
//!
//! Every response carries `Connection: close`: one connection, one request,
//! one slot. The slot is bound at accept and reaches handlers as
//! [`ConnectInfo<SlotLease>`]; serve with
//! `into_make_service_with_connect_info::<SlotLease>()`.

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, warn};

use crate::admission::{SlotLease, SlotTable};
use crate::card::ServiceCard;
use crate::codec::OutputFormat;
use crate::error::{MediaError, RejectReason};
use crate::lifecycle::{RequestLifecycle, RequestOptions, Upload};
use crate::metrics::MetricsSnapshot;
use crate::storage::ArtifactId;

#[derive(Clone)]
pub struct AppState {
    pub lifecycle: Arc<RequestLifecycle>,
    pub slots: Arc<SlotTable>,
    pub card: Arc<ServiceCard>,
    pub worker_index: usize,
    pub started: Instant,
}

impl AppState {
    pub fn new(lifecycle: Arc<RequestLifecycle>, slots: Arc<SlotTable>, worker_index: usize) -> Self {
        let card = ServiceCard::describe(lifecycle.config(), lifecycle.registry());
        Self {
            lifecycle,
            slots,
            card: Arc::new(card),
            worker_index,
            started: Instant::now(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/media", post(submit_media))
        .route("/artifacts/{id}", get(get_artifact))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/capabilities", get(capabilities))
        .layer(SetResponseHeaderLayer::overriding(
            header::CONNECTION,
            HeaderValue::from_static("close"),
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Media(#[from] MediaError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub detail: String,
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Media(e) => media_status(e),
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::Media(e) => e.code().as_str(),
            ApiError::NotFound(_) => "NotFound",
            ApiError::Internal(_) => "Internal",
        }
    }
}

/// Status code for a taxonomy error
pub fn media_status(err: &MediaError) -> StatusCode {
    match err {
        MediaError::PayloadRejected(RejectReason::TooLarge { .. }) => StatusCode::PAYLOAD_TOO_LARGE,
        MediaError::PayloadRejected(RejectReason::DisallowedType(_) | RejectReason::DisallowedExtension(_)) => {
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        }
        MediaError::PayloadRejected(RejectReason::BodyTimeout { .. }) => StatusCode::REQUEST_TIMEOUT,
        MediaError::PayloadRejected(_) => StatusCode::BAD_REQUEST,
        MediaError::UnsupportedFormat(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        MediaError::CorruptInput(_) | MediaError::TransformFault { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        MediaError::EncodeFault(_) | MediaError::IoFault { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!("{} {}", status, self);
        }
        let body = ErrorBody {
            code: self.code().to_string(),
            detail: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

// ============================================================================
// Handlers
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct SubmitQuery {
    pub stages: Option<String>,
    pub format: Option<String>,
    pub filename: Option<String>,
}

async fn submit_media(
    State(state): State<AppState>,
    ConnectInfo(lease): ConnectInfo<SlotLease>,
    Query(query): Query<SubmitQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ApiError> {
    let config = state.lifecycle.config();
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let declared_size = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());

    // an oversized or undeclared body is refused by admission without being read
    let bytes = match declared_size {
        Some(declared) if declared <= config.max_upload_bytes => {
            let read = axum::body::to_bytes(body, config.max_upload_bytes as usize);
            let limit = config.body_timeout();
            tokio::time::timeout(limit, read)
                .await
                .map_err(|_| {
                    warn!(request_id = %lease.request_id(), "Body not received within {:?}", limit);
                    MediaError::PayloadRejected(RejectReason::BodyTimeout { secs: limit.as_secs() })
                })?
                .map_err(|e| {
                    debug!("Body read failed: {}", e);
                    MediaError::PayloadRejected(RejectReason::Unreadable)
                })?
                .to_vec()
        }
        _ => Vec::new(),
    };

    let upload = Upload {
        bytes,
        content_type,
        declared_size,
        filename: query.filename,
    };
    let options = RequestOptions {
        stages: query.stages,
        format: query.format,
    };

    // the lease moves into the blocking task so the slot and its permit are
    // held until the pipeline returns, even if the client disconnects
    let request_id = lease.request_id();
    let lifecycle = Arc::clone(&state.lifecycle);
    let receipt = tokio::task::spawn_blocking(move || {
        let _lease = lease;
        lifecycle.process(request_id, upload, &options)
    })
    .await
    .map_err(|e| ApiError::Internal(format!("pipeline task failed: {}", e)))??;

    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, receipt.location.clone())],
        Json(receipt),
    )
        .into_response())
}

async fn get_artifact(State(state): State<AppState>, Path(id): Path<String>) -> Result<Response, ApiError> {
    let not_found = || ApiError::NotFound(format!("artifact '{}'", id));
    let artifact_id = ArtifactId::parse(&id).ok_or_else(not_found)?;
    let path = state
        .lifecycle
        .storage()
        .find_artifact(&artifact_id)
        .ok_or_else(not_found)?;

    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| MediaError::io("read artifact", e))?;
    let mime = path
        .extension()
        .and_then(|e| e.to_str())
        .map(OutputFormat::mime_for_extension)
        .unwrap_or("application/octet-stream");

    Ok(([(header::CONTENT_TYPE, mime)], bytes).into_response())
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub pid: u32,
    pub worker: usize,
    pub slots: usize,
    pub slots_in_use: usize,
    pub uptime_secs: u64,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        pid: std::process::id(),
        worker: state.worker_index,
        slots: state.slots.capacity(),
        slots_in_use: state.slots.in_use(),
        uptime_secs: state.started.elapsed().as_secs(),
    })
}

async fn metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.lifecycle.metrics().snapshot())
}

async fn capabilities(State(state): State<AppState>) -> Json<ServiceCard> {
    Json(state.card.as_ref().clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (
                MediaError::PayloadRejected(RejectReason::TooLarge { declared: 2, limit: 1 }),
                StatusCode::PAYLOAD_TOO_LARGE,
            ),
            (
                MediaError::PayloadRejected(RejectReason::DisallowedType("text/plain".into())),
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ),
            (MediaError::PayloadRejected(RejectReason::Empty), StatusCode::BAD_REQUEST),
            (
                MediaError::PayloadRejected(RejectReason::BodyTimeout { secs: 30 }),
                StatusCode::REQUEST_TIMEOUT,
            ),
            (MediaError::UnsupportedFormat("x".into()), StatusCode::UNSUPPORTED_MEDIA_TYPE),
            (MediaError::CorruptInput("x".into()), StatusCode::UNPROCESSABLE_ENTITY),
            (MediaError::transform("blur", "x"), StatusCode::UNPROCESSABLE_ENTITY),
            (MediaError::EncodeFault("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
            (
                MediaError::io("commit artifact", std::io::ErrorKind::Other.into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(media_status(&err), status, "{:?}", err);
        }
    }

    #[test]
    fn test_api_error_code_uses_taxonomy() {
        let err = ApiError::from(MediaError::io("x", std::io::ErrorKind::Other.into()));
        assert_eq!(err.code(), ErrorCode::IoFault.as_str());
        assert_eq!(ApiError::NotFound("x".into()).status_code(), StatusCode::NOT_FOUND);
    }
}
