//! LLM 层：客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）

pub mod deepseek;
pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;

pub use deepseek::{create_deepseek_client, DEEPSEEK_CHAT, DEEPSEEK_REASONER};
pub use mock::MockLlmClient;
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::{ChatMessage, ChatRole, LlmClient, LlmError};

use crate::config::LlmSection;
use crate::core::HiveError;

/// 根据 [llm] 段创建客户端
///
/// - provider = "mock"：离线脚本客户端
/// - provider = "deepseek"：API Key 取 llm.api_key，其次 `DEEPSEEK_API_KEY`
/// - provider = "openai"：API Key 取 llm.api_key，其次 `OPENAI_API_KEY`
///
/// 缺少 API Key 属于配置错误，启动时即失败
pub fn create_llm_from_config(cfg: &LlmSection) -> Result<Arc<dyn LlmClient>, HiveError> {
    let key_from = |env: &str| {
        cfg.api_key
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| std::env::var(env).ok().filter(|k| !k.is_empty()))
            .ok_or_else(|| HiveError::Config(format!("llm.api_key or {env} must be set")))
    };

    match cfg.provider.as_str() {
        "mock" => Ok(Arc::new(MockLlmClient::new())),
        "deepseek" => {
            let key = key_from("DEEPSEEK_API_KEY")?;
            Ok(Arc::new(create_deepseek_client(
                cfg.base_url.as_deref(),
                &cfg.model,
                &key,
            )))
        }
        "openai" => {
            let key = key_from("OPENAI_API_KEY")?;
            Ok(Arc::new(OpenAiClient::new(
                cfg.base_url.as_deref(),
                &cfg.model,
                &key,
            )))
        }
        other => Err(HiveError::Config(format!("unknown llm provider '{other}'"))),
    }
}
