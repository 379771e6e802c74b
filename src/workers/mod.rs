//! 名册成员的具体实现与工厂
//!
//! - **ControllerWorker**：LLM 驱动，面向用户并分派
//! - **SpecialistWorker**：LLM 生成能力调用，执行绑定的 Capability
//! - **DefaultWorkerFactory**：每轮按 WorkerSpec 构建全新实例

pub mod capability;
pub mod controller;
pub mod specialist;

use std::collections::HashMap;
use std::sync::Arc;

use crate::core::{HiveError, Roster, Worker, WorkerFactory, WorkerRole, WorkerSpec};
use crate::llm::LlmClient;

pub use capability::{
    invoke_audited, Capability, CapabilityError, CreateTicket, PricingLookup, ShipmentLookup,
};
pub use controller::{controller_prompt, ControllerWorker};
pub use specialist::{parse_tool_call, SpecialistWorker, ToolCall};

/// 默认工厂：共享 LLM 与能力实例，Worker 本身每轮新建
pub struct DefaultWorkerFactory {
    llm: Arc<dyn LlmClient>,
    capabilities: HashMap<String, Arc<dyn Capability>>,
    markers: Vec<String>,
    /// WorkerSpec.prompt_path 读出的提示词覆盖
    prompts: HashMap<String, String>,
}

impl DefaultWorkerFactory {
    pub fn new(llm: Arc<dyn LlmClient>, markers: Vec<String>) -> Self {
        Self {
            llm,
            capabilities: HashMap::new(),
            markers,
            prompts: HashMap::new(),
        }
    }

    /// 以能力名（pricing / shipment / ticket）注册
    pub fn with_capability(mut self, key: impl Into<String>, capability: Arc<dyn Capability>) -> Self {
        self.capabilities.insert(key.into(), capability);
        self
    }

    /// 启动时一次性读取提示词文件，读不到即为配置错误
    pub fn load_prompts(mut self, roster: &Roster) -> Result<Self, HiveError> {
        for spec in roster.actors() {
            if let Some(path) = &spec.prompt_path {
                let prompt = std::fs::read_to_string(path).map_err(|e| {
                    HiveError::Config(format!(
                        "cannot read prompt for '{}' from {}: {}",
                        spec.name,
                        path.display(),
                        e
                    ))
                })?;
                self.prompts.insert(spec.name.clone(), prompt);
            }
        }
        Ok(self)
    }
}

impl WorkerFactory for DefaultWorkerFactory {
    fn build(&self, spec: &WorkerSpec, roster: &Roster) -> Result<Box<dyn Worker>, HiveError> {
        match spec.role {
            WorkerRole::Controller => {
                let prompt = self
                    .prompts
                    .get(&spec.name)
                    .cloned()
                    .unwrap_or_else(|| controller_prompt(roster, &self.markers));
                Ok(Box::new(ControllerWorker::new(
                    spec.name.clone(),
                    self.llm.clone(),
                    prompt,
                )))
            }
            WorkerRole::Specialist => {
                let key = spec.capability.as_deref().unwrap_or_default();
                let capability = self.capabilities.get(key).cloned().ok_or_else(|| {
                    HiveError::Config(format!(
                        "no capability '{}' registered for '{}'",
                        key, spec.name
                    ))
                })?;
                Ok(Box::new(SpecialistWorker::new(
                    spec.name.clone(),
                    roster.controller_name(),
                    self.llm.clone(),
                    capability,
                )))
            }
            WorkerRole::Proxy => Err(HiveError::Config(format!(
                "proxy '{}' stands for the end user and is never instantiated",
                spec.name
            ))),
        }
    }
}
