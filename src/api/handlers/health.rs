use axum::{extract::State, http::header, response::IntoResponse, Json};
use serde::Serialize;

use crate::api::{
    state::AppState,
    types::{api_error, ApiResult},
};
use crate::services::FleetHealth;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FarmHealthResponse {
    #[serde(flatten)]
    pub fleet: FleetHealth,
    pub uptime_secs: i64,
}

/// GET /api/terminal-farm/health
pub async fn farm_health(State(state): State<AppState>) -> ApiResult<FarmHealthResponse> {
    let fleet = state.farm.fleet_health().await.map_err(api_error)?;
    Ok(Json(FarmHealthResponse {
        fleet,
        uptime_secs: state.uptime_seconds(),
    }))
}

/// GET /health
pub async fn liveness() -> &'static str {
    "OK"
}

/// GET /metrics
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.farm.metrics.prometheus(),
    )
}
