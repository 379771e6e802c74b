//! 容错外部调用
//!
//! - 每个请求附带 Bearer token
//! - 401 时刷新一次凭据并**只重试一次**，避免对宕机依赖无限重试
//! - 其它非 2xx 归类为 BadRequest / NotFound / Server / Unexpected，返回带标签的失败而不是 panic
//! - 传输层超时 / 连接错误单独归类；取消令牌触发时立即返回 Cancelled

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// 错误响应体在日志与错误信息中保留的最大字符数
const ERROR_BODY_PREVIEW_CHARS: usize = 500;

/// 外部调用失败分类
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("bad request ({status}): {body}")]
    BadRequest { status: u16, body: String },

    #[error("not found: {body}")]
    NotFound { body: String },

    /// 刷新凭据并重试后仍为 401
    #[error("unauthorized after credential refresh: {body}")]
    Unauthorized { body: String },

    #[error("server error ({status}): {body}")]
    Server { status: u16, body: String },

    #[error("unexpected status {status}: {body}")]
    Unexpected { status: u16, body: String },

    #[error("request timed out")]
    Timeout,

    #[error("connection error: {0}")]
    Connection(String),

    #[error("failed to decode response: {0}")]
    Decode(String),

    /// 获取或刷新凭据本身失败
    #[error("credential error: {0}")]
    Credentials(String),

    #[error("request cancelled")]
    Cancelled,
}

impl CallError {
    /// 按 HTTP 状态码归类非 2xx 响应
    pub fn classify(status: StatusCode, body: String) -> Self {
        let body = truncate(&body);
        match status {
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => CallError::BadRequest {
                status: status.as_u16(),
                body,
            },
            StatusCode::NOT_FOUND => CallError::NotFound { body },
            StatusCode::UNAUTHORIZED => CallError::Unauthorized { body },
            s if s.is_server_error() => CallError::Server {
                status: s.as_u16(),
                body,
            },
            s => CallError::Unexpected {
                status: s.as_u16(),
                body,
            },
        }
    }

    fn from_transport(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            CallError::Timeout
        } else {
            CallError::Connection(e.to_string())
        }
    }

    /// 超时、连接错误、5xx 属于暂时性外部错误
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CallError::Timeout | CallError::Connection(_) | CallError::Server { .. }
        )
    }

    /// 简短的分类标签（审计日志与结构化错误结果使用）
    pub fn outcome(&self) -> &'static str {
        match self {
            CallError::BadRequest { .. } => "bad_request",
            CallError::NotFound { .. } => "not_found",
            CallError::Unauthorized { .. } => "unauthorized",
            CallError::Server { .. } => "server_error",
            CallError::Unexpected { .. } => "unexpected",
            CallError::Timeout => "timeout",
            CallError::Connection(_) => "connection",
            CallError::Decode(_) => "decode",
            CallError::Credentials(_) => "credentials",
            CallError::Cancelled => "cancelled",
        }
    }
}

fn truncate(s: &str) -> String {
    if s.chars().count() > ERROR_BODY_PREVIEW_CHARS {
        format!("{}...", s.chars().take(ERROR_BODY_PREVIEW_CHARS).collect::<String>())
    } else {
        s.to_string()
    }
}

/// 凭据来源：当前 token 与强制刷新
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> Result<String, CallError>;

    /// 收到 401 后调用，返回新 token
    async fn refresh(&self) -> Result<String, CallError>;
}

/// 固定 token（私有应用 / API Key）；刷新即返回原值
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self) -> Result<String, CallError> {
        Ok(self.0.clone())
    }

    async fn refresh(&self) -> Result<String, CallError> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

struct RefreshState {
    access_token: Option<String>,
    refresh_token: String,
}

/// OAuth refresh_token 授权：首次使用或 401 时换取新的 access token（支持 refresh token 轮换）
pub struct RefreshingToken {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    state: RwLock<RefreshState>,
}

impl RefreshingToken {
    pub fn new(
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        refresh_token: impl Into<String>,
        initial_access_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, CallError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CallError::Connection(e.to_string()))?;
        Ok(Self {
            http,
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            state: RwLock::new(RefreshState {
                access_token: initial_access_token.filter(|t| !t.is_empty()),
                refresh_token: refresh_token.into(),
            }),
        })
    }
}

#[async_trait]
impl TokenProvider for RefreshingToken {
    async fn token(&self) -> Result<String, CallError> {
        if let Some(token) = self.state.read().await.access_token.clone() {
            return Ok(token);
        }
        self.refresh().await
    }

    async fn refresh(&self) -> Result<String, CallError> {
        let mut state = self.state.write().await;
        let form = [
            ("grant_type", "refresh_token"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("refresh_token", state.refresh_token.as_str()),
        ];
        let resp = self
            .http
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .map_err(CallError::from_transport)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(CallError::Credentials(format!(
                "token refresh failed ({}): {}",
                status,
                truncate(&body)
            )));
        }
        let parsed: RefreshResponse = resp
            .json()
            .await
            .map_err(|e| CallError::Credentials(format!("invalid token response: {e}")))?;

        if let Some(rotated) = parsed.refresh_token {
            state.refresh_token = rotated;
        }
        state.access_token = Some(parsed.access_token.clone());
        tracing::info!(token_url = %self.token_url, "Access token refreshed");
        Ok(parsed.access_token)
    }
}

/// 容错 HTTP 客户端：一个实例对应一个外部服务
pub struct ResilientClient {
    name: String,
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenProvider>,
}

impl ResilientClient {
    /// `timeout` 为单次请求（含重试中的每一次）的超时
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        tokens: Arc<dyn TokenProvider>,
        timeout: Duration,
    ) -> Result<Self, CallError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CallError::Connection(e.to_string()))?;
        Ok(Self {
            name: name.into(),
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<T, CallError> {
        self.send(Method::GET, path, None, cancel).await
    }

    pub async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<T, CallError> {
        self.send(Method::POST, path, Some(body), cancel).await
    }

    /// 发送请求并把 2xx 响应体解码为 T（空响应体按 JSON null 解码）
    pub async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
        cancel: &CancellationToken,
    ) -> Result<T, CallError> {
        let start = Instant::now();
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let mut retried = false;

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(CallError::Cancelled),
            r = self.send_with_refresh(method.clone(), &url, body, &mut retried) => r,
        };

        let audit = serde_json::json!({
            "event": "external_call",
            "target": self.name,
            "method": method.as_str(),
            "path": path,
            "ok": result.is_ok(),
            "outcome": result.as_ref().err().map(|e| e.outcome()).unwrap_or("ok"),
            "retried": retried,
            "duration_ms": start.elapsed().as_millis() as u64,
        });
        tracing::info!(audit = %audit.to_string(), "external");

        result
    }

    async fn send_with_refresh<T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        body: Option<&serde_json::Value>,
        retried: &mut bool,
    ) -> Result<T, CallError> {
        let token = self.tokens.token().await?;
        let mut resp = self.send_once(method.clone(), url, body, &token).await?;

        if resp.status() == StatusCode::UNAUTHORIZED {
            tracing::warn!(target_service = %self.name, "Unauthorized, refreshing credentials and retrying once");
            let token = self.tokens.refresh().await?;
            *retried = true;
            resp = self.send_once(method, url, body, &token).await?;
        }

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(CallError::classify(status, text));
        }

        let bytes = resp.bytes().await.map_err(CallError::from_transport)?;
        let raw: &[u8] = if bytes.is_empty() { b"null" } else { &bytes };
        serde_json::from_slice(raw).map_err(|e| CallError::Decode(e.to_string()))
    }

    async fn send_once(
        &self,
        method: Method,
        url: &str,
        body: Option<&serde_json::Value>,
        token: &str,
    ) -> Result<reqwest::Response, CallError> {
        let mut req = self.http.request(method, url).bearer_auth(token);
        if let Some(body) = body {
            req = req.json(body);
        }
        req.send().await.map_err(CallError::from_transport)
    }
}
