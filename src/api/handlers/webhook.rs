//! Endpoints the remote terminal agents call.

use axum::{extract::State, http::HeaderMap, http::StatusCode, Json};
use serde_json::Value;

use crate::api::{
    auth::{ensure_header_secret, AGENT_KEY_HEADER},
    state::AppState,
    types::{
        api_error, log_error, public_message, status_for, AckResponse, ApiError, ApiResult,
    },
};
use crate::domain::{HeartbeatResponse, SyncSummary};

fn ensure_agent(state: &AppState, headers: &HeaderMap) -> std::result::Result<(), ApiError> {
    ensure_header_secret(
        headers,
        AGENT_KEY_HEADER,
        state.security.webhook_secret.as_deref(),
    )
}

/// POST /api/webhook/terminal/heartbeat
///
/// Failures keep the heartbeat response shape so agents only parse one body.
pub async fn heartbeat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> std::result::Result<Json<HeartbeatResponse>, (StatusCode, Json<HeartbeatResponse>)> {
    if let Err((status, Json(err))) = ensure_agent(&state, &headers) {
        return Err((status, Json(HeartbeatResponse::failure(err.error))));
    }

    match state.farm.dispatcher.handle_heartbeat(body).await {
        Ok(response) => Ok(Json(response)),
        Err(e) => {
            log_error(&e);
            Err((
                status_for(&e),
                Json(HeartbeatResponse::failure(public_message(&e))),
            ))
        }
    }
}

/// POST /api/webhook/terminal/trades
pub async fn sync_trades(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> ApiResult<SyncSummary> {
    ensure_agent(&state, &headers)?;
    state
        .farm
        .reconciler
        .handle_trades(body)
        .await
        .map(Json)
        .map_err(api_error)
}

/// POST /api/webhook/terminal/positions
pub async fn sync_positions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> ApiResult<AckResponse> {
    ensure_agent(&state, &headers)?;
    let count = state
        .farm
        .dispatcher
        .handle_positions(body)
        .await
        .map_err(api_error)?;
    Ok(Json(AckResponse {
        success: true,
        count: count as u64,
    }))
}

/// POST /api/webhook/terminal/candles
pub async fn sync_candles(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> ApiResult<AckResponse> {
    ensure_agent(&state, &headers)?;
    let completed = state
        .farm
        .candles
        .handle_candles(body)
        .await
        .map_err(api_error)?;
    Ok(Json(AckResponse {
        success: true,
        count: completed,
    }))
}
