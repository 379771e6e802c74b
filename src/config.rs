//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__LLM__PROVIDER=openai`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::core::{default_roster_specs, HiveError, Roster, WorkerSpec};
use crate::core::termination::{default_markers, DEFAULT_MAX_MESSAGES};
use crate::integrations::ReplyMode;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub orchestrator: OrchestratorSection,
    pub store: StoreSection,
    pub server: ServerSection,
    pub webhook: WebhookSection,
    pub crm: CrmSection,
    pub pricing: ApiSection,
    pub shipment: ApiSection,
    /// 名册（[[roster]]），缺省为 Coordinator + 三个专家 + user
    pub roster: Vec<WorkerSpec>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app: AppSection::default(),
            llm: LlmSection::default(),
            orchestrator: OrchestratorSection::default(),
            store: StoreSection::default(),
            server: ServerSection::default(),
            webhook: WebhookSection::default(),
            crm: CrmSection::default(),
            pricing: ApiSection::default(),
            shipment: ApiSection::default(),
            roster: default_roster_specs(),
        }
    }
}

/// [app] 段：对外可见的固定文案
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    #[serde(default = "default_app_name")]
    pub name: String,
    /// 本轮失败时返回给用户的通用回复（不含内部细节）
    #[serde(default = "default_failure_reply")]
    pub failure_reply: String,
    /// 无实时订阅者时，先同步发送的“已收到”确认
    #[serde(default = "default_ack_reply")]
    pub ack_reply: String,
}

fn default_app_name() -> String {
    "hive".to_string()
}

fn default_failure_reply() -> String {
    "Sorry, something went wrong on our side. Please try again in a moment.".to_string()
}

fn default_ack_reply() -> String {
    "Thanks, we received your message and are looking into it.".to_string()
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            failure_reply: default_failure_reply(),
            ack_reply: default_ack_reply(),
        }
    }
}

/// [llm] 段：后端选择
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：deepseek / openai / mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    /// 未设置时读取对应的环境变量
    pub api_key: Option<String>,
}

fn default_provider() -> String {
    "deepseek".to_string()
}

fn default_model() -> String {
    "deepseek-chat".to_string()
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            api_key: None,
        }
    }
}

/// [orchestrator] 段：终止条件、超时、历史上限、单会话串行
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorSection {
    /// 单轮最大消息数（含用户输入）
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    /// controller 输出中表示完成 / 失败的标记
    #[serde(default = "default_markers")]
    pub markers: Vec<String>,
    /// 单次 Worker 调用超时（秒）
    #[serde(default = "default_worker_timeout_secs")]
    pub worker_timeout_secs: u64,
    /// 整轮超时（秒）
    #[serde(default = "default_turn_timeout_secs")]
    pub turn_timeout_secs: u64,
    /// 快照中保留的最大历史消息数，0 表示不限
    #[serde(default = "default_max_history_messages")]
    pub max_history_messages: usize,
    /// 同一会话的多轮请求串行执行（关闭则为 last-writer-wins）
    #[serde(default = "default_single_flight")]
    pub single_flight: bool,
}

fn default_max_messages() -> usize {
    DEFAULT_MAX_MESSAGES
}

fn default_worker_timeout_secs() -> u64 {
    60
}

fn default_turn_timeout_secs() -> u64 {
    180
}

fn default_max_history_messages() -> usize {
    200
}

fn default_single_flight() -> bool {
    true
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_messages: default_max_messages(),
            markers: default_markers(),
            worker_timeout_secs: default_worker_timeout_secs(),
            turn_timeout_secs: default_turn_timeout_secs(),
            max_history_messages: default_max_history_messages(),
            single_flight: default_single_flight(),
        }
    }
}

/// [store] 段：快照存储后端
#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    /// memory / sqlite
    #[serde(default = "default_store_backend")]
    pub backend: String,
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: PathBuf,
}

fn default_store_backend() -> String {
    "memory".to_string()
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("data/snapshots.db")
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            sqlite_path: default_sqlite_path(),
        }
    }
}

/// [server] 段：HTTP 与 WebSocket 监听地址
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_notify_addr")]
    pub notify_addr: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_notify_addr() -> String {
    "0.0.0.0:3001".to_string()
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            notify_addr: default_notify_addr(),
        }
    }
}

/// [webhook] 段：订阅类型与去重窗口
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookSection {
    #[serde(default = "default_webhook_enabled")]
    pub enabled: bool,
    /// 需要处理的订阅类型
    #[serde(default = "default_subscription_types")]
    pub subscription_types: Vec<String>,
    /// 处理成功后仍视为重复投递的时间窗口（秒）
    #[serde(default = "default_completed_ttl_secs")]
    pub completed_ttl_secs: u64,
}

fn default_webhook_enabled() -> bool {
    true
}

fn default_subscription_types() -> Vec<String> {
    vec!["conversation.newMessage".to_string()]
}

fn default_completed_ttl_secs() -> u64 {
    600
}

impl Default for WebhookSection {
    fn default() -> Self {
        Self {
            enabled: default_webhook_enabled(),
            subscription_types: default_subscription_types(),
            completed_ttl_secs: default_completed_ttl_secs(),
        }
    }
}

/// [crm.oauth] 段：refresh_token 授权
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthSection {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
}

/// [crm] 段：会话平台 API
#[derive(Debug, Clone, Deserialize)]
pub struct CrmSection {
    #[serde(default = "default_crm_base_url")]
    pub base_url: String,
    /// 私有应用 token；配置了 oauth 时作为初始 access token
    pub access_token: Option<String>,
    pub oauth: Option<OAuthSection>,
    /// 以哪个 actor 的身份发送回复（如 A-12345）
    pub sender_actor_id: Option<String>,
    /// 回复作为对外消息（message）还是内部备注（comment）
    #[serde(default)]
    pub reply_mode: ReplyMode,
    /// 创建工单时使用的 pipeline / stage
    #[serde(default = "default_ticket_pipeline")]
    pub ticket_pipeline: String,
    #[serde(default = "default_ticket_stage")]
    pub ticket_stage: String,
    #[serde(default = "default_call_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_crm_base_url() -> String {
    "https://api.hubapi.com".to_string()
}

fn default_ticket_pipeline() -> String {
    "0".to_string()
}

fn default_ticket_stage() -> String {
    "1".to_string()
}

fn default_call_timeout_secs() -> u64 {
    15
}

impl Default for CrmSection {
    fn default() -> Self {
        Self {
            base_url: default_crm_base_url(),
            access_token: None,
            oauth: None,
            sender_actor_id: None,
            reply_mode: ReplyMode::default(),
            ticket_pipeline: default_ticket_pipeline(),
            ticket_stage: default_ticket_stage(),
            timeout_secs: default_call_timeout_secs(),
        }
    }
}

impl CrmSection {
    pub fn has_credentials(&self) -> bool {
        self.oauth.is_some() || self.access_token.as_deref().is_some_and(|t| !t.is_empty())
    }
}

/// [pricing] / [shipment] 段：只需 base_url + API Key 的外部服务
#[derive(Debug, Clone, Deserialize)]
pub struct ApiSection {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    #[serde(default = "default_call_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            timeout_secs: default_call_timeout_secs(),
        }
    }
}

impl ApiSection {
    /// 返回 (base_url, api_key)，缺任一项即为配置错误
    pub fn endpoint(&self, section: &str) -> Result<(String, String), HiveError> {
        let base_url = self
            .base_url
            .clone()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| HiveError::Config(format!("{section}.base_url must be set")))?;
        let api_key = self
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| HiveError::Config(format!("{section}.api_key must be set")))?;
        Ok((base_url, api_key))
    }
}

impl AppConfig {
    /// 启动前校验：名册合法；启用的集成都有端点与凭据
    pub fn validate(&self) -> Result<Roster, HiveError> {
        let roster = Roster::new(self.roster.clone())?;

        let needs_crm = self.webhook.enabled
            || roster
                .specialists()
                .any(|s| s.capability.as_deref() == Some("ticket"));
        if needs_crm && !self.crm.has_credentials() {
            return Err(HiveError::Config(
                "crm.access_token or [crm.oauth] must be set".to_string(),
            ));
        }

        for spec in roster.specialists() {
            match spec.capability.as_deref() {
                Some("pricing") => {
                    self.pricing.endpoint("pricing")?;
                }
                Some("shipment") => {
                    self.shipment.endpoint("shipment")?;
                }
                Some("ticket") => {}
                Some(other) => {
                    return Err(HiveError::Config(format!(
                        "worker '{}' has unknown capability '{other}'",
                        spec.name
                    )))
                }
                None => {
                    return Err(HiveError::Config(format!(
                        "specialist '{}' has no capability",
                        spec.name
                    )))
                }
            }
        }
        Ok(roster)
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
