//! HTTP API
//!
//! - `POST /api/provision` runs a provisioning pass from the configured manifest
//! - `POST /api/events/creation` is the creation event intake; a 503 asks the
//!   channel to redeliver
//! - `GET /api/audit/:name` and `POST /api/audit/:name/replay` expose the
//!   dedupe ledger and the manual replay path
//! - `GET /q/health` and `GET /metrics`

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, warn};
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

use pa_common::{CorrelationState, CreationEvent};
use pa_correlator::{CorrelatorError, EventCorrelator, HandleOutcome};
use pa_provisioner::{DesiredState, ProvisionError, Provisioner};

#[derive(Clone)]
pub struct AppState {
    pub provisioner: Arc<Provisioner>,
    pub correlator: Arc<EventCorrelator>,
    pub manifest_path: PathBuf,
    pub metrics: Option<PrometheusHandle>,
    pub shutdown: broadcast::Sender<()>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// Result of one creation event delivery
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryResponse {
    /// EMITTED, DUPLICATE or AWAITING_REPLAY
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
}

/// Ledger view of one principal. Never includes the secret value.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuditStatusResponse {
    pub principal_name: String,
    pub state: CorrelationState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emitted_at: Option<DateTime<Utc>>,
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Provisioning Audit API",
        version = "0.1.0",
        description = "Principal provisioning, creation event correlation and audit replay"
    ),
    paths(
        health_handler,
        metrics_handler,
        provision_handler,
        creation_event_handler,
        audit_status_handler,
        replay_handler,
    ),
    components(schemas(
        HealthResponse,
        ErrorResponse,
        DeliveryResponse,
        AuditStatusResponse,
        CreationEvent,
        CorrelationState,
    )),
    tags(
        (name = "health", description = "Health and metrics"),
        (name = "provisioning", description = "Desired-state reconciliation"),
        (name = "events", description = "Creation event intake"),
        (name = "audit", description = "Audit ledger and replay"),
    )
)]
pub struct ApiDoc;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .route("/q/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/api/provision", post(provision_handler))
        .route("/api/events/creation", post(creation_event_handler))
        .route("/api/audit/:name", get(audit_status_handler))
        .route("/api/audit/:name/replay", post(replay_handler))
        .with_state(state)
}

fn error_response(status: StatusCode, error: &str, message: impl ToString) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            message: message.to_string(),
        }),
    )
        .into_response()
}

fn correlator_error_response(e: &CorrelatorError) -> Response {
    match e {
        CorrelatorError::CorrelationTimeout { .. } | CorrelatorError::Cancelled { .. } => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, "RETRY_LATER", e)
        }
        CorrelatorError::SinkRejected { .. } => error_response(StatusCode::BAD_GATEWAY, "SINK_REJECTED", e),
        CorrelatorError::NothingToReplay { .. } => error_response(StatusCode::CONFLICT, "NOTHING_TO_REPLAY", e),
        CorrelatorError::Secrets(_) | CorrelatorError::Registry(_) => {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", e)
        }
    }
}

/// Health check
#[utoipa::path(
    get,
    path = "/q/health",
    tag = "health",
    responses(
        (status = 200, description = "Service is up", body = HealthResponse)
    )
)]
async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "UP".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Prometheus metrics
#[utoipa::path(
    get,
    path = "/metrics",
    tag = "health",
    responses(
        (status = 200, description = "Prometheus metrics", content_type = "text/plain")
    )
)]
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()).into_response(),
        None => (StatusCode::OK, String::new()).into_response(),
    }
}

/// Run a provisioning pass from the configured manifest
#[utoipa::path(
    post,
    path = "/api/provision",
    tag = "provisioning",
    responses(
        (status = 200, description = "Every entry converged; body is the provisioning report"),
        (status = 422, description = "Some entries failed; body is the provisioning report"),
        (status = 400, description = "Manifest could not be read", body = ErrorResponse),
        (status = 500, description = "Pass aborted", body = ErrorResponse)
    )
)]
async fn provision_handler(State(state): State<AppState>) -> Response {
    let desired = match DesiredState::from_file(&state.manifest_path).await {
        Ok(desired) => desired,
        Err(e) => {
            warn!(path = ?state.manifest_path, error = %e, "Failed to load manifest");
            return error_response(StatusCode::BAD_REQUEST, "INVALID_MANIFEST", e);
        }
    };

    match state.provisioner.provision(&desired).await {
        Ok(report) if report.is_success() => (StatusCode::OK, Json(report)).into_response(),
        Ok(report) => (StatusCode::UNPROCESSABLE_ENTITY, Json(report)).into_response(),
        Err(e @ ProvisionError::Secrets(_)) => {
            error!(error = %e, "Provisioning pass aborted");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "SECRET_UNAVAILABLE", e)
        }
        Err(e) => {
            error!(error = %e, "Provisioning pass aborted");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "PROVISIONING_FAILED", e)
        }
    }
}

/// Accept one creation event delivery
#[utoipa::path(
    post,
    path = "/api/events/creation",
    tag = "events",
    request_body = CreationEvent,
    responses(
        (status = 200, description = "Delivery processed", body = DeliveryResponse),
        (status = 503, description = "Not correlated yet, redeliver later", body = ErrorResponse),
        (status = 502, description = "Audit sink refused the record", body = ErrorResponse)
    )
)]
async fn creation_event_handler(State(state): State<AppState>, Json(event): Json<CreationEvent>) -> Response {
    let mut shutdown = state.shutdown.subscribe();

    match state.correlator.handle_with_shutdown(&event, &mut shutdown).await {
        Ok(HandleOutcome::Emitted(record)) => Json(DeliveryResponse {
            status: CorrelationState::Emitted.to_string(),
            record_id: Some(record.record_id),
        })
        .into_response(),
        Ok(HandleOutcome::Duplicate) => Json(DeliveryResponse {
            status: "DUPLICATE".to_string(),
            record_id: None,
        })
        .into_response(),
        Ok(HandleOutcome::AwaitingReplay) => Json(DeliveryResponse {
            status: "AWAITING_REPLAY".to_string(),
            record_id: None,
        })
        .into_response(),
        Err(e) => correlator_error_response(&e),
    }
}

/// Ledger state for a principal
#[utoipa::path(
    get,
    path = "/api/audit/{name}",
    tag = "audit",
    params(("name" = String, Path, description = "Principal name")),
    responses(
        (status = 200, description = "Ledger entry", body = AuditStatusResponse)
    )
)]
async fn audit_status_handler(State(state): State<AppState>, Path(name): Path<String>) -> Json<AuditStatusResponse> {
    let entry = state.correlator.entry(&name);
    Json(AuditStatusResponse {
        principal_name: name,
        state: entry.state,
        record_id: entry.record.as_ref().map(|r| r.record_id.clone()),
        event_id: entry.event_id,
        emitted_at: entry
            .record
            .as_ref()
            .filter(|_| entry.state == CorrelationState::Emitted)
            .map(|r| r.emitted_at),
    })
}

/// Re-emit a record the audit sink refused
#[utoipa::path(
    post,
    path = "/api/audit/{name}/replay",
    tag = "audit",
    params(("name" = String, Path, description = "Principal name")),
    responses(
        (status = 200, description = "Record emitted", body = DeliveryResponse),
        (status = 409, description = "No correlated record awaiting replay", body = ErrorResponse),
        (status = 502, description = "Audit sink refused the record again", body = ErrorResponse)
    )
)]
async fn replay_handler(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.correlator.replay(&name).await {
        Ok(record) => Json(DeliveryResponse {
            status: CorrelationState::Emitted.to_string(),
            record_id: Some(record.record_id),
        })
        .into_response(),
        Err(e) => correlator_error_response(&e),
    }
}
