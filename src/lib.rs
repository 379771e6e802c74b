//! Hive - 多智能体客服编排服务
//!
//! 模块划分：
//! - **api**: HTTP 入口（同步对话、Webhook、健康检查）
//! - **app**: 按配置装配组件
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 消息、名册、发言选择、终止判定、会话快照、一轮编排、优雅关闭
//! - **http**: 容错外部调用（Bearer 鉴权、401 刷新重试、错误分类）
//! - **integrations**: CRM 会话平台、报价、物流 API 客户端
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）
//! - **notify**: 按会话推送“处理中 / 处理完成”信号（WebSocket）
//! - **observability**: 日志初始化
//! - **store**: 会话快照存储（内存 / SQLite）
//! - **webhook**: Webhook 去重与后台处理流水线
//! - **workers**: 协调者 / 专家 Worker 与能力（工具）

pub mod api;
pub mod app;
pub mod config;
pub mod core;
pub mod http;
pub mod integrations;
pub mod llm;
pub mod notify;
pub mod observability;
pub mod store;
pub mod webhook;
pub mod workers;

pub use app::{create_components, AppComponents};
pub use core::{TurnOrchestrator, TurnOutcome, TurnRequest};
