use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ride_map::{
    points_in_band, BandTable, HazardPoint, HazardStore, IngestBatch, RangeFilter, RmError,
    SessionAggregator, SeverityBand,
};
use serde::Serialize;
use thiserror::Error;

pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const APP_COMMIT: &str = env!("GIT_COMMIT_HASH");

pub struct AppState {
    pub aggregator: SessionAggregator,
    pub store: Arc<dyn HazardStore>,
    pub bands: BandTable,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("malformed request body: {0}")]
    BadRequest(String),
    #[error("unknown severity band '{0}'")]
    UnknownBand(String),
    #[error(transparent)]
    Domain(#[from] RmError),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::UnknownBand(_) => StatusCode::NOT_FOUND,
            ApiError::Domain(err) => match err {
                RmError::InvalidInput(_) => StatusCode::BAD_REQUEST,
                RmError::OutOfOrderSample { .. } => StatusCode::CONFLICT,
                RmError::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                RmError::Config(_) | RmError::AlertDelivery(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "InvalidInput",
            ApiError::UnknownBand(_) => "UnknownBand",
            ApiError::Domain(err) => err.kind(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(target: "ride_map::server", error = %self, "request failed");
        } else {
            tracing::debug!(target: "ride_map::server", error = %self, "request rejected");
        }
        let body = ErrorResponse {
            success: false,
            error: self.error_code().to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub success: bool,
    pub stored: usize,
    pub points: Vec<HazardPoint>,
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub version: &'static str,
    pub commit: &'static str,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/sendData", post(send_data_handler))
        .route("/getData", post(get_data_handler))
        .route("/bands", get(list_bands_handler))
        .route("/bands/:band", get(band_points_handler))
        .route("/healthz", get(health_handler))
        .with_state(state)
}

async fn send_data_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<IngestBatch>, JsonRejection>,
) -> Result<Json<IngestResponse>, ApiError> {
    let Json(batch) = payload?;
    let session_id = batch.session_id.clone();
    let samples = batch.into_samples()?;
    let store = state.store.as_ref();
    let points = state
        .aggregator
        .ingest_batch_then(&session_id, &samples, |points| {
            store.append_samples(&samples)?;
            store.put_all(points).map(|_| ()).map_err(|err| {
                tracing::error!(
                    target: "ride_map::server",
                    session = %session_id,
                    points = points.len(),
                    error = %err,
                    "raw samples stored but closed windows were not; batch discarded"
                );
                err
            })
        })?;

    tracing::info!(
        target: "ride_map::server",
        session = %session_id,
        samples = samples.len(),
        points = points.len(),
        "samples ingested"
    );
    Ok(Json(IngestResponse {
        success: true,
        stored: samples.len(),
        points,
    }))
}

async fn get_data_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RangeFilter>, JsonRejection>,
) -> Result<Json<Vec<HazardPoint>>, ApiError> {
    let Json(filter) = payload?;
    let points: Vec<HazardPoint> = state.store.query(&filter)?.collect();
    tracing::debug!(target: "ride_map::server", matches = points.len(), "range query served");
    Ok(Json(points))
}

async fn list_bands_handler(State(state): State<Arc<AppState>>) -> Json<Vec<SeverityBand>> {
    Json(state.bands.iter().cloned().collect())
}

async fn band_points_handler(
    State(state): State<Arc<AppState>>,
    Path(band): Path<String>,
) -> Result<Json<Vec<HazardPoint>>, ApiError> {
    if state.bands.get(&band).is_none() {
        return Err(ApiError::UnknownBand(band));
    }
    let points: Vec<HazardPoint> =
        points_in_band(state.store.as_ref(), &state.bands, &band)?.collect();
    tracing::debug!(
        target: "ride_map::server",
        band = %band,
        matches = points.len(),
        "band query served"
    );
    Ok(Json(points))
}

async fn health_handler() -> Json<HealthReport> {
    Json(HealthReport {
        status: "ok",
        version: APP_VERSION,
        commit: APP_COMMIT,
    })
}
