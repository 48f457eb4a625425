use axum::{
    extract::{Path, State},
    Json,
};
use uuid::Uuid;

use crate::api::{
    state::AppState,
    types::{api_error, ApiResult},
};
use crate::domain::SyncSummary;

/// POST /api/connections/:id/sync
///
/// Runs the full deploy, fetch and undeploy cycle inline; expect minutes on a cold start.
pub async fn sync_connection(
    State(state): State<AppState>,
    Path(connection_id): Path<Uuid>,
) -> ApiResult<SyncSummary> {
    state
        .farm
        .connections
        .sync(connection_id)
        .await
        .map(Json)
        .map_err(api_error)
}
