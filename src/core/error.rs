//! 编排错误类型
//!
//! 与一轮对话（turn）的失败语义配合：配置错误启动即失败；校验错误立即返回；
//! 外部调用、Worker、超时、取消类错误中止当前轮且不写快照。

use thiserror::Error;

use crate::http::CallError;
use crate::llm::LlmError;
use crate::store::StoreError;

/// 编排过程中可能出现的错误
#[derive(Error, Debug)]
pub enum HiveError {
    /// 缺少凭据 / 端点 / 非法名册，启动时即为致命错误
    #[error("Config error: {0}")]
    Config(String),

    /// 调用方传入的字段缺失或格式错误，不重试
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Worker '{worker}' failed: {reason}")]
    Worker { worker: String, reason: String },

    #[error("Worker '{0}' timed out")]
    WorkerTimeout(String),

    #[error("Turn deadline exceeded")]
    TurnTimeout,

    #[error("Turn cancelled")]
    Cancelled,

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    /// 外部 API（CRM / 报价 / 物流）调用失败
    #[error("External call failed: {0}")]
    External(#[from] CallError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl HiveError {
    pub fn worker(worker: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Worker {
            worker: worker.into(),
            reason: reason.into(),
        }
    }

    /// 是否属于调用方输入问题（对外返回 400 而不是通用失败）
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// 对外可见的错误分类标签，不包含内部细节
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "configuration",
            Self::Validation(_) => "validation",
            Self::Worker { .. } | Self::Llm(_) => "worker_failed",
            Self::WorkerTimeout(_) | Self::TurnTimeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::External(_) => "external_failure",
            Self::Store(_) => "store_failure",
        }
    }
}
