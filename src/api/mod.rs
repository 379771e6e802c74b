//! HTTP 入口
//!
//! - `POST /chat`：同步对话，返回回复与会话 ID（未传时生成）
//! - `POST /webhook`：接收通知批次，立即 202，真正的处理在后台任务中
//! - `GET /health`

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::core::{ShutdownManager, TurnOrchestrator, TurnRequest};
use crate::webhook::{WebhookNotification, WebhookPipeline};

/// 路由共享状态
pub struct ApiState {
    pub orchestrator: Arc<TurnOrchestrator>,
    /// 未启用 Webhook 时为 None，对应路由返回 404
    pub pipeline: Option<Arc<WebhookPipeline>>,
    pub shutdown: Arc<ShutdownManager>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub reply: String,
    pub conversation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn create_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/chat", post(api_chat))
        .route("/webhook", post(api_webhook))
        .route("/health", get(|| async { "OK" }))
        .with_state(state)
}

fn bad_request(message: impl Into<String>) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message.into() }))).into_response()
}

async fn api_chat(State(state): State<Arc<ApiState>>, Json(req): Json<ChatRequest>) -> Response {
    let message = req.message.trim();
    if message.is_empty() {
        return bad_request("message is required");
    }

    let mut request = TurnRequest::new(message);
    if let Some(id) = req.conversation_id.filter(|s| !s.trim().is_empty()) {
        request = request.in_conversation(id);
    }

    match state
        .orchestrator
        .run_turn(request, state.shutdown.turn_token())
        .await
    {
        Ok(outcome) => Json(ChatResponse {
            reply: outcome.reply,
            conversation_id: outcome.conversation_id,
            stop_reason: Some(outcome.stop_reason.to_string()),
            error: None,
        })
        .into_response(),
        Err(failure) if failure.error.is_validation() => bad_request(failure.error.to_string()),
        Err(failure) => {
            tracing::warn!(
                conversation_id = %failure.conversation_id,
                kind = failure.error.kind(),
                "Chat turn failed: {}",
                failure.error
            );
            Json(ChatResponse {
                reply: state.orchestrator.fallback_reply().to_string(),
                conversation_id: failure.conversation_id,
                stop_reason: None,
                error: Some(failure.error.kind().to_string()),
            })
            .into_response()
        }
    }
}

async fn api_webhook(
    State(state): State<Arc<ApiState>>,
    Json(batch): Json<Vec<WebhookNotification>>,
) -> Response {
    let Some(pipeline) = state.pipeline.as_ref() else {
        return (StatusCode::NOT_FOUND, Json(json!({ "error": "webhook disabled" }))).into_response();
    };
    let received = batch.len();
    let accepted = pipeline.accept_batch(batch).len();
    tracing::info!(received, accepted, "Webhook batch received");
    (StatusCode::ACCEPTED, Json(json!({ "accepted": accepted }))).into_response()
}
