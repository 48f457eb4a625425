use axum::{http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::FarmError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub success: bool,
    pub error: String,
}

pub type ApiError = (StatusCode, Json<ErrorBody>);
pub type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

/// HTTP status for a domain error
pub fn status_for(err: &FarmError) -> StatusCode {
    match err {
        FarmError::Validation(_) => StatusCode::BAD_REQUEST,
        FarmError::NotFound { .. } => StatusCode::NOT_FOUND,
        FarmError::AlreadyEnabled(_) | FarmError::NotEnabled(_) => StatusCode::CONFLICT,
        FarmError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
        FarmError::DeployTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Message safe to return to a caller. Storage and transport details stay in the logs.
pub fn public_message(err: &FarmError) -> String {
    match status_for(err) {
        StatusCode::INTERNAL_SERVER_ERROR => "internal error".to_string(),
        _ => err.to_string(),
    }
}

/// Expected rejections log at debug, everything else at error
pub fn log_error(err: &FarmError) {
    if err.is_expected() {
        debug!("request rejected: {}", err);
    } else {
        error!("request failed: {}", err);
    }
}

pub fn api_error(err: FarmError) -> ApiError {
    log_error(&err);
    (
        status_for(&err),
        Json(ErrorBody {
            success: false,
            error: public_message(&err),
        }),
    )
}

pub fn unauthorized(message: &str) -> ApiError {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorBody {
            success: false,
            error: message.to_string(),
        }),
    )
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnableRequest {
    pub user_id: Uuid,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleResponse {
    pub success: bool,
    pub terminal_id: Uuid,
    pub status: crate::domain::TerminalStatus,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AckResponse {
    pub success: bool,
    pub count: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueCandlesRequest {
    pub symbol: String,
    pub timeframe: String,
    pub start: chrono::DateTime<chrono::Utc>,
    pub end: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueCandlesResponse {
    pub queued: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_id: Option<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&FarmError::Validation("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&FarmError::QuotaExceeded { current: 60, max: 60 }),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            status_for(&FarmError::NotEnabled("a".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&FarmError::DeployTimeout("slow".into())),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn test_internal_errors_are_not_echoed() {
        let err = FarmError::Internal("pool exhausted at 10.0.0.5".into());
        assert_eq!(public_message(&err), "internal error");
    }
}
