use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::api::{handlers, state::AppState};

pub fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Terminal agent webhooks
        .route(
            "/api/webhook/terminal/heartbeat",
            post(handlers::heartbeat),
        )
        .route("/api/webhook/terminal/trades", post(handlers::sync_trades))
        .route(
            "/api/webhook/terminal/positions",
            post(handlers::sync_positions),
        )
        .route(
            "/api/webhook/terminal/candles",
            post(handlers::sync_candles),
        )
        // Orchestrator feed
        .route(
            "/api/orchestrator/config",
            get(handlers::orchestrator_config),
        )
        // Account control
        .route(
            "/api/accounts/:id/enable-autosync",
            post(handlers::enable_autosync),
        )
        .route(
            "/api/accounts/:id/disable-autosync",
            post(handlers::disable_autosync),
        )
        .route(
            "/api/accounts/:id/terminal-status",
            get(handlers::account_terminal_status),
        )
        .route("/api/terminals/:id/status", get(handlers::terminal_status))
        .route("/api/trades/:id/candles", post(handlers::queue_candles))
        .route(
            "/api/connections/:id/sync",
            post(handlers::sync_connection),
        )
        // Health
        .route("/api/terminal-farm/health", get(handlers::farm_health))
        .route("/health", get(handlers::liveness))
        .route("/metrics", get(handlers::metrics))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
