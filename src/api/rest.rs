//! REST API Handlers
//!
//! Exposes the upgrade workflow over HTTP, plus health and metrics.

use crate::domain::ports::{MigrationType, UpgradeVolumeRequest, VolumeRecord};
use crate::error::Error;
use crate::upgrade::PvUpgrader;
use axum::{
    extract::{Json, Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

// =============================================================================
// Request/Response Types
// =============================================================================

/// Body of an upgrade request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgradeVolumeBody {
    /// Requested migration, only "csi" is accepted
    #[serde(rename = "type")]
    pub migration_type: String,
}

/// Successful upgrade response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgradeVolumeResponse {
    pub volume: VolumeRecord,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ApiErrorResponse {
    /// Status code and body for a failed upgrade
    pub fn from_error(err: &Error) -> (StatusCode, Self) {
        let (status, code) = match err.cause() {
            Error::MigrationInProgress { .. } => (StatusCode::CONFLICT, "upgrade_in_progress"),
            Error::WaitTimeout { .. } => (StatusCode::GATEWAY_TIMEOUT, "wait_timeout"),
            Error::Precondition(p) if p.is_not_found() => (StatusCode::NOT_FOUND, "not_found"),
            Error::Precondition(_) => (StatusCode::PRECONDITION_FAILED, "precondition_failed"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "upgrade_failed"),
        };

        (
            status,
            Self {
                error: code.into(),
                message: err.to_string(),
                details: err.phase().map(|phase| phase.as_str().to_string()),
            },
        )
    }
}

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    upgrader: Arc<PvUpgrader>,
}

impl RestRouter {
    /// Create a new REST router
    pub fn new(upgrader: Arc<PvUpgrader>) -> Self {
        Self { upgrader }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState {
            upgrader: self.upgrader,
        };

        Router::new()
            .route("/v1/volume/:name/upgrade", post(upgrade_volume))
            .route("/health", get(health_check))
            .route("/metrics", get(metrics))
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    upgrader: Arc<PvUpgrader>,
}

// =============================================================================
// Handlers
// =============================================================================

fn error_reply(err: &Error) -> axum::response::Response {
    let (status, body) = ApiErrorResponse::from_error(err);
    (status, Json(body)).into_response()
}

/// Upgrade a volume
async fn upgrade_volume(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<UpgradeVolumeBody>,
) -> impl IntoResponse {
    info!(volume = %name, migration_type = %body.migration_type, "Upgrade requested");

    let migration_type = match body.migration_type.parse::<MigrationType>() {
        Ok(t) => t,
        Err(e) => return error_reply(&Error::from(e)),
    };

    let request = UpgradeVolumeRequest {
        volume: name,
        migration_type,
    };

    match state.upgrader.upgrade_volume(&request).await {
        Ok(volume) => (StatusCode::OK, Json(UpgradeVolumeResponse { volume })).into_response(),
        Err(e) => {
            error!(volume = %request.volume, error = %e, "Upgrade failed");
            error_reply(&e)
        }
    }
}

/// Health check
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Prometheus metrics
async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    match state.upgrader.metrics().render() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => error_reply(&e),
    }
}
