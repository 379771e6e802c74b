//! Worker 契约与名册
//!
//! - **Worker**：无跨轮状态的执行者，每轮由 `WorkerFactory` 从静态配置重新构建；
//!   私有记忆只能通过 export / import 随快照迁移
//! - **Roster**：固定顺序的 Worker 集合（恰好一个 controller、一个 proxy、若干 specialist）
//! - **TurnContext**：本轮显式上下文（会话 ID、取消令牌），替代任何全局状态

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::error::HiveError;
use super::message::{Message, SYSTEM_SOURCE, USER_SOURCE};

/// Worker 角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerRole {
    /// 唯一可以面向用户并分派任务的 Worker
    Controller,
    /// 只由 controller 调用
    Specialist,
    /// 代表外部终端用户
    Proxy,
}

/// 单个 Worker 的静态配置（对应 config 中的 [[roster]] 条目）
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSpec {
    pub name: String,
    pub role: WorkerRole,
    /// 供 controller 提示词使用的能力描述
    #[serde(default)]
    pub description: String,
    /// specialist 绑定的能力名：pricing / shipment / ticket
    #[serde(default)]
    pub capability: Option<String>,
    /// 可选：覆盖默认提示词的文件路径
    #[serde(default)]
    pub prompt_path: Option<PathBuf>,
}

impl WorkerSpec {
    pub fn new(name: impl Into<String>, role: WorkerRole) -> Self {
        Self {
            name: name.into(),
            role,
            description: String::new(),
            capability: None,
            prompt_path: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capability = Some(capability.into());
        self
    }
}

/// 默认名册：Coordinator 统筹，报价 / 物流 / 工单三个专家
pub fn default_roster_specs() -> Vec<WorkerSpec> {
    vec![
        WorkerSpec::new("Coordinator", WorkerRole::Controller)
            .with_description("Talks to the customer and delegates to specialists."),
        WorkerSpec::new("PricingWorker", WorkerRole::Specialist)
            .with_description("Looks up prices and availability for a product SKU.")
            .with_capability("pricing"),
        WorkerSpec::new("ShipmentWorker", WorkerRole::Specialist)
            .with_description("Looks up the delivery status of a shipment by tracking number.")
            .with_capability("shipment"),
        WorkerSpec::new("TicketWorker", WorkerRole::Specialist)
            .with_description("Opens a support ticket for a human agent, linked to this conversation.")
            .with_capability("ticket"),
        WorkerSpec::new(USER_SOURCE, WorkerRole::Proxy),
    ]
}

/// 校验过的名册
#[derive(Debug, Clone)]
pub struct Roster {
    specs: Vec<WorkerSpec>,
    controller: usize,
}

impl Roster {
    /// 校验：名称唯一且可作为委派标记；恰好一个 controller；恰好一个 proxy 且名为 `user`
    pub fn new(specs: Vec<WorkerSpec>) -> Result<Self, HiveError> {
        let mut controller = None;
        let mut proxies = 0usize;
        for (i, spec) in specs.iter().enumerate() {
            if !is_valid_worker_name(&spec.name) {
                return Err(HiveError::Config(format!(
                    "invalid worker name '{}'",
                    spec.name
                )));
            }
            if spec.name == SYSTEM_SOURCE {
                return Err(HiveError::Config(format!(
                    "worker name '{SYSTEM_SOURCE}' is reserved"
                )));
            }
            if specs[..i].iter().any(|s| s.name == spec.name) {
                return Err(HiveError::Config(format!(
                    "duplicate worker name '{}'",
                    spec.name
                )));
            }
            match spec.role {
                WorkerRole::Controller => {
                    if controller.replace(i).is_some() {
                        return Err(HiveError::Config(
                            "roster must contain exactly one controller".to_string(),
                        ));
                    }
                }
                WorkerRole::Proxy => {
                    if spec.name != USER_SOURCE {
                        return Err(HiveError::Config(format!(
                            "proxy worker must be named '{USER_SOURCE}', got '{}'",
                            spec.name
                        )));
                    }
                    proxies += 1;
                }
                WorkerRole::Specialist => {}
            }
        }
        let controller = controller.ok_or_else(|| {
            HiveError::Config("roster must contain exactly one controller".to_string())
        })?;
        if proxies != 1 {
            return Err(HiveError::Config(format!(
                "roster must contain exactly one '{USER_SOURCE}' proxy"
            )));
        }
        Ok(Self { specs, controller })
    }

    pub fn controller(&self) -> &WorkerSpec {
        &self.specs[self.controller]
    }

    pub fn controller_name(&self) -> &str {
        &self.specs[self.controller].name
    }

    pub fn get(&self, name: &str) -> Option<&WorkerSpec> {
        self.specs.iter().find(|s| s.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn role_of(&self, name: &str) -> Option<WorkerRole> {
        self.get(name).map(|s| s.role)
    }

    pub fn is_specialist(&self, name: &str) -> bool {
        self.role_of(name) == Some(WorkerRole::Specialist)
    }

    pub fn specialists(&self) -> impl Iterator<Item = &WorkerSpec> {
        self.specs
            .iter()
            .filter(|s| s.role == WorkerRole::Specialist)
    }

    /// 需要实例化的成员（proxy 只是用户的占位，不会被调度）
    pub fn actors(&self) -> impl Iterator<Item = &WorkerSpec> {
        self.specs.iter().filter(|s| s.role != WorkerRole::Proxy)
    }

    pub fn specs(&self) -> &[WorkerSpec] {
        &self.specs
    }
}

/// 与委派标记 `<Name> :` 的语法一致
pub fn is_valid_worker_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// 本轮上下文：显式传入每次 act 调用
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub conversation_id: String,
    /// 本轮序号（从 1 开始）
    pub turn_count: u64,
    pub cancel: CancellationToken,
}

/// Worker 调用契约
#[async_trait]
pub trait Worker: Send {
    fn name(&self) -> &str;

    /// 读取当前日志并产出一条消息；可能调用外部能力
    async fn act(&mut self, log: &[Message], ctx: &TurnContext) -> Result<Message, HiveError>;

    /// 导出私有记忆，随快照持久化；无记忆时返回 None
    fn export_memory(&self) -> Option<serde_json::Value> {
        None
    }

    /// 从快照恢复私有记忆
    fn import_memory(&mut self, _memory: serde_json::Value) -> Result<(), String> {
        Ok(())
    }
}

/// 每轮从静态配置构建全新的 Worker 实例
pub trait WorkerFactory: Send + Sync {
    fn build(&self, spec: &WorkerSpec, roster: &Roster) -> Result<Box<dyn Worker>, HiveError>;
}
