mod common;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use std::sync::Arc;
use termfarm::adapters::MemoryStore;
use termfarm::api::{create_router, AppState};
use termfarm::config::SecurityConfig;
use termfarm::domain::TerminalStatus;
use tower::ServiceExt;

use common::{account, farm, seeded_terminal};

const AGENT_KEY: &str = "agent-secret";
const ORCHESTRATOR_KEY: &str = "orchestrator-secret";

fn router(store: Arc<MemoryStore>) -> Router {
    let security = SecurityConfig {
        webhook_secret: Some(AGENT_KEY.to_string()),
        orchestrator_secret: Some(ORCHESTRATOR_KEY.to_string()),
        ..SecurityConfig::default()
    };
    create_router(AppState::new(farm(store), security))
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-api-key", AGENT_KEY)
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

#[tokio::test]
async fn heartbeat_for_known_terminal_is_ok() {
    let store = Arc::new(MemoryStore::new());
    let (_, terminal) = seeded_terminal(&store, TerminalStatus::Starting).await;

    let (status, body) = send(
        router(store),
        post_json(
            "/api/webhook/terminal/heartbeat",
            json!({ "terminalId": terminal.id.to_string() }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "success": true }));
}

#[tokio::test]
async fn heartbeat_for_unknown_terminal_is_404() {
    let store = Arc::new(MemoryStore::new());

    let (status, body) = send(
        router(store),
        post_json(
            "/api/webhook/terminal/heartbeat",
            json!({ "terminalId": uuid::Uuid::new_v4().to_string() }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], json!(false));
}

#[tokio::test]
async fn malformed_trade_sync_is_400() {
    let store = Arc::new(MemoryStore::new());

    let (status, body) = send(
        router(store),
        post_json("/api/webhook/terminal/trades", json!({ "terminalId": "nope", "trades": [] })),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], json!(false));
}

#[tokio::test]
async fn webhook_without_agent_key_is_401() {
    let store = Arc::new(MemoryStore::new());
    let (_, terminal) = seeded_terminal(&store, TerminalStatus::Running).await;

    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/webhook/terminal/heartbeat")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({ "terminalId": terminal.id.to_string() }).to_string()))
        .unwrap();
    let (status, body) = send(router(store.clone()), request).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["success"], json!(false));
    let stored = termfarm::FarmStore::get_terminal(store.as_ref(), terminal.id)
        .await
        .unwrap()
        .unwrap();
    assert!(stored.last_heartbeat.is_none());
}

#[tokio::test]
async fn orchestrator_feed_requires_secret_and_is_not_cached() {
    let store = Arc::new(MemoryStore::new());
    seeded_terminal(&store, TerminalStatus::Pending).await;
    let app = router(store);

    let denied = Request::builder()
        .uri("/api/orchestrator/config")
        .header("x-orchestrator-secret", "wrong")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(app.clone(), denied).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let allowed = Request::builder()
        .uri("/api/orchestrator/config")
        .header("x-orchestrator-secret", ORCHESTRATOR_KEY)
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(allowed).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CACHE_CONTROL], "no-store");

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let feed: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(feed[0]["status"], json!("RUNNING"));
    assert_eq!(feed[0]["environment"]["MT5_PASSWORD"], json!("broker-pass"));
}

#[tokio::test]
async fn enable_then_enable_again_conflicts() {
    let store = Arc::new(MemoryStore::new());
    let acct = account(dec!(1000));
    store.insert_account(acct.clone()).await;
    let app = router(store);
    let uri = format!("/api/accounts/{}/enable-autosync", acct.id);
    let body = json!({ "userId": acct.user_id });

    let (status, first) = send(app.clone(), post_json(&uri, body.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["status"], json!("PENDING"));

    let (status, second) = send(app.clone(), post_json(&uri, body)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(second["success"], json!(false));

    let disable = format!("/api/accounts/{}/disable-autosync", acct.id);
    let (status, stopped) = send(app, post_json(&disable, json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stopped["status"], json!("STOPPING"));
}

#[tokio::test]
async fn farm_health_reports_fleet() {
    let store = Arc::new(MemoryStore::new());
    seeded_terminal(&store, TerminalStatus::Pending).await;
    let app = router(store);

    let request = Request::builder()
        .uri("/api/terminal-farm/health")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(app.clone(), request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], json!(1));
    assert_eq!(body["status"], json!("unhealthy"));

    let live = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let response = app.oneshot(live).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
