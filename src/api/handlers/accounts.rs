use axum::{
    extract::{Path, State},
    Json,
};
use uuid::Uuid;

use crate::api::{
    state::AppState,
    types::{
        api_error, ApiResult, EnableRequest, LifecycleResponse, QueueCandlesRequest,
        QueueCandlesResponse,
    },
};
use crate::services::TerminalStatusView;

/// POST /api/accounts/:id/enable-autosync
pub async fn enable_autosync(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
    Json(req): Json<EnableRequest>,
) -> ApiResult<LifecycleResponse> {
    let terminal = state
        .farm
        .lifecycle
        .enable(account_id, req.user_id)
        .await
        .map_err(api_error)?;
    Ok(Json(LifecycleResponse {
        success: true,
        terminal_id: terminal.id,
        status: terminal.status,
    }))
}

/// POST /api/accounts/:id/disable-autosync
pub async fn disable_autosync(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
) -> ApiResult<LifecycleResponse> {
    let terminal = state
        .farm
        .lifecycle
        .disable(account_id)
        .await
        .map_err(api_error)?;
    Ok(Json(LifecycleResponse {
        success: true,
        terminal_id: terminal.id,
        status: terminal.status,
    }))
}

/// GET /api/accounts/:id/terminal-status
pub async fn account_terminal_status(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
) -> ApiResult<TerminalStatusView> {
    state
        .farm
        .lifecycle
        .status_for_account(account_id)
        .await
        .map(Json)
        .map_err(api_error)
}

/// GET /api/terminals/:id/status
pub async fn terminal_status(
    State(state): State<AppState>,
    Path(terminal_id): Path<Uuid>,
) -> ApiResult<TerminalStatusView> {
    state
        .farm
        .lifecycle
        .status_for_terminal(terminal_id)
        .await
        .map(Json)
        .map_err(api_error)
}

/// POST /api/trades/:id/candles
pub async fn queue_candles(
    State(state): State<AppState>,
    Path(trade_id): Path<Uuid>,
    Json(req): Json<QueueCandlesRequest>,
) -> ApiResult<QueueCandlesResponse> {
    let command = state
        .farm
        .candles
        .queue_fetch_candles(trade_id, &req.symbol, &req.timeframe, req.start, req.end)
        .await
        .map_err(api_error)?;
    Ok(Json(QueueCandlesResponse {
        queued: command.is_some(),
        command_id: command.map(|c| c.id),
    }))
}
