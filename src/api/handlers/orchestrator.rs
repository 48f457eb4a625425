use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderValue},
    response::{IntoResponse, Response},
    Json,
};

use crate::api::{
    auth::{ensure_header_secret, ORCHESTRATOR_SECRET_HEADER},
    state::AppState,
    types::{api_error, ApiError},
};

/// GET /api/orchestrator/config
///
/// The only route that returns decrypted broker passwords.
pub async fn orchestrator_config(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> std::result::Result<Response, ApiError> {
    ensure_header_secret(
        &headers,
        ORCHESTRATOR_SECRET_HEADER,
        state.security.orchestrator_secret.as_deref(),
    )?;

    let directives = state
        .farm
        .lifecycle
        .orchestrator_config()
        .await
        .map_err(api_error)?;

    let mut response = Json(directives).into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    Ok(response)
}
