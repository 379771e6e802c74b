//! HTTP 入口：对话、校验错误、失败时的通用回复、Webhook 202

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use hive::api::{create_router, ApiState, ChatResponse};
use hive::config::AppConfig;
use hive::core::{
    default_roster_specs, HiveError, OrchestratorSettings, Roster, ShutdownManager,
    TerminationDetector, TurnOrchestrator, Worker, WorkerFactory, WorkerSpec,
};
use hive::create_components;
use hive::store::MemorySessionStore;
use serde_json::{json, Value};
use tower::ServiceExt;

fn minimal_roster() -> Vec<WorkerSpec> {
    default_roster_specs()
        .into_iter()
        .filter(|s| s.name == "Coordinator" || s.name == "user")
        .collect()
}

async fn mock_app(webhook: bool) -> Router {
    let mut cfg = AppConfig::default();
    cfg.llm.provider = "mock".to_string();
    cfg.roster = minimal_roster();
    cfg.webhook.enabled = webhook;
    cfg.crm.access_token = Some("pat-test".to_string());
    cfg.crm.base_url = "http://127.0.0.1:9".to_string();
    let components = create_components(&cfg, Arc::new(ShutdownManager::new()))
        .await
        .unwrap();
    create_router(components.api_state())
}

async fn post(app: Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

#[tokio::test]
async fn test_chat_mints_and_echoes_conversation_id() {
    let app = mock_app(false).await;

    let (status, body) = post(app.clone(), "/chat", json!({ "message": "hello" })).await;
    assert_eq!(status, StatusCode::OK);
    let first: ChatResponse = serde_json::from_value(body).unwrap();
    assert!(first.conversation_id.starts_with("conv_"));
    assert_eq!(first.reply, "Echo from Mock: hello");
    assert_eq!(first.stop_reason.as_deref(), Some("deferred"));
    assert!(first.error.is_none());

    let (status, body) = post(
        app,
        "/chat",
        json!({ "message": "again", "conversationId": first.conversation_id }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["conversationId"], json!(first.conversation_id));
    assert_eq!(body["reply"], json!("Echo from Mock: again"));
}

#[tokio::test]
async fn test_chat_rejects_empty_message() {
    let app = mock_app(false).await;
    let (status, body) = post(app, "/chat", json!({ "message": "   " })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("message"));
}

struct BrokenFactory;

impl WorkerFactory for BrokenFactory {
    fn build(&self, spec: &WorkerSpec, _roster: &Roster) -> Result<Box<dyn Worker>, HiveError> {
        Err(HiveError::worker(&spec.name, "model backend unreachable"))
    }
}

#[tokio::test]
async fn test_turn_failure_returns_generic_reply() {
    let orchestrator = Arc::new(TurnOrchestrator::new(
        Arc::new(MemorySessionStore::new()),
        Roster::new(minimal_roster()).unwrap(),
        Arc::new(BrokenFactory),
        TerminationDetector::default(),
        OrchestratorSettings::default().with_fallback_reply("Please try again later."),
    ));
    let app = create_router(Arc::new(ApiState {
        orchestrator,
        pipeline: None,
        shutdown: Arc::new(ShutdownManager::new()),
    }));

    let (status, body) = post(
        app,
        "/chat",
        json!({ "message": "hi", "conversationId": "conv_42" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["reply"], json!("Please try again later."));
    assert_eq!(body["conversationId"], json!("conv_42"));
    assert_eq!(body["error"], json!("worker_failed"));
    assert!(!body.to_string().contains("unreachable"));
}

#[tokio::test]
async fn test_webhook_acknowledges_immediately() {
    let app = mock_app(true).await;
    let (status, body) = post(
        app,
        "/webhook",
        json!([{ "eventId": 1, "subscriptionType": "conversation.creation", "objectId": 9 }]),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["accepted"], json!(0));
}

#[tokio::test]
async fn test_webhook_disabled_is_not_found() {
    let app = mock_app(false).await;
    let (status, _) = post(app, "/webhook", json!([])).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_health() {
    let app = mock_app(false).await;
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
