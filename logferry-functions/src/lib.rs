//! HTTP surface for the two entry points.
//!
//! `POST /transfer` takes an object-finalize event, `POST /sweep` is hit by
//! the external scheduler, and `GET /healthz` is the liveness probe.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use logferry_cloud::{CleanupSweeper, FerryError, SweepReport, TransferOutcome, TransferWorker, TriggerEvent};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::error;

/// Shared state for every handler.
#[derive(Clone)]
pub struct AppState {
    worker: Arc<TransferWorker>,
    sweeper: Arc<CleanupSweeper>,
    transfers: Arc<Semaphore>,
    staleness_threshold: Duration,
}

impl AppState {
    pub fn new(
        worker: Arc<TransferWorker>,
        sweeper: Arc<CleanupSweeper>,
        max_concurrent_transfers: usize,
        staleness_threshold: Duration,
    ) -> Self {
        Self {
            worker,
            sweeper,
            transfers: Arc::new(Semaphore::new(max_concurrent_transfers.max(1))),
            staleness_threshold,
        }
    }
}

/// Error answer of a handler.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<FerryError> for ApiError {
    fn from(e: FerryError) -> Self {
        let status = match e {
            FerryError::Busy(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("request failed: {e}");
        }
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/transfer", post(transfer))
        .route("/sweep", post(sweep))
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

/// Every per-object result is a 200 with the outcome; the sweeper owns
/// retries. Only operator-level failures answer 500.
async fn transfer(
    State(state): State<AppState>,
    Json(event): Json<TriggerEvent>,
) -> Result<Json<TransferOutcome>, ApiError> {
    let _permit = state.transfers.try_acquire().map_err(|_| ApiError {
        status: StatusCode::TOO_MANY_REQUESTS,
        message: "too many transfers in flight".to_string(),
    })?;

    let outcome = state.worker.handle_event(&event).await?;
    Ok(Json(outcome))
}

async fn sweep(State(state): State<AppState>) -> Result<Json<SweepReport>, ApiError> {
    let report = state.sweeper.sweep(state.staleness_threshold).await?;
    Ok(Json(report))
}
