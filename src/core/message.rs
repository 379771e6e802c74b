//! 消息模型：会话日志中的单条记录
//!
//! 消息一旦追加到日志即不可变；`source` 为 Worker 名称，或终端用户 / 系统哨兵。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 终端用户（外部访客）在日志中的来源标识
pub const USER_SOURCE: &str = "user";
/// 编排器自身插入的系统事件来源标识
pub const SYSTEM_SOURCE: &str = "system";

/// 消息类别
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    ToolCall,
    ToolResult,
    SystemEvent,
}

/// 消息内容：纯文本，或结构化的工具结果
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    Text { text: String },
    Structured { payload: serde_json::Value },
}

impl MessageContent {
    /// 文本视图：结构化内容序列化为紧凑 JSON
    pub fn as_text(&self) -> String {
        match self {
            MessageContent::Text { text } => text.clone(),
            MessageContent::Structured { payload } => payload.to_string(),
        }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            MessageContent::Text { text } => Some(text),
            MessageContent::Structured { .. } => None,
        }
    }
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub source: String,
    pub content: MessageContent,
    pub kind: MessageKind,
    pub created_at: DateTime<Utc>,
}

impl Message {
    fn build(source: impl Into<String>, content: MessageContent, kind: MessageKind) -> Self {
        Self {
            id: format!("msg_{}", uuid::Uuid::new_v4()),
            source: source.into(),
            content,
            kind,
            created_at: Utc::now(),
        }
    }

    /// 终端用户输入
    pub fn user(text: impl Into<String>) -> Self {
        Self::text(USER_SOURCE, text)
    }

    /// 某个 Worker 产出的文本
    pub fn text(source: impl Into<String>, text: impl Into<String>) -> Self {
        Self::build(
            source,
            MessageContent::Text { text: text.into() },
            MessageKind::Text,
        )
    }

    pub fn tool_call(source: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::build(
            source,
            MessageContent::Structured { payload },
            MessageKind::ToolCall,
        )
    }

    pub fn tool_result(source: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::build(
            source,
            MessageContent::Structured { payload },
            MessageKind::ToolResult,
        )
    }

    /// 编排器插入的系统事件（如委派目标不存在的纠正提示）
    pub fn system_event(text: impl Into<String>) -> Self {
        Self::build(
            SYSTEM_SOURCE,
            MessageContent::Text { text: text.into() },
            MessageKind::SystemEvent,
        )
    }

    pub fn is_from(&self, source: &str) -> bool {
        self.source == source
    }

    pub fn is_user(&self) -> bool {
        self.source == USER_SOURCE
    }

    pub fn as_text(&self) -> String {
        self.content.as_text()
    }
}
