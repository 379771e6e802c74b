//! 会话与快照
//!
//! Session 只在单次请求内存在；跨请求续接只依赖 Snapshot（带版本号的 JSON）。
//! restore(snapshot) → append → 跑一轮 → snapshot() 应与一直保持同一个 Session 等价。

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::message::{Message, SYSTEM_SOURCE, USER_SOURCE};
use super::worker::Roster;

/// 当前快照格式版本；不一致即视为不兼容
pub const SNAPSHOT_VERSION: u32 = 1;

/// 快照解析 / 恢复错误（归入“快照损坏”类：丢弃后从空会话开始）
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("malformed snapshot: {0}")]
    Malformed(String),

    #[error("incompatible snapshot version: expected {expected}, got {found}")]
    Incompatible { expected: u32, found: u64 },

    #[error("snapshot belongs to conversation '{found}', expected '{expected}'")]
    ConversationMismatch { expected: String, found: String },

    #[error("snapshot references unknown worker '{0}'")]
    UnknownWorker(String),

    #[error("failed to encode snapshot: {0}")]
    Encode(String),
}

/// 会话快照：完整消息日志 + 各 Worker 私有记忆
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub conversation_id: String,
    pub turn_count: u64,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub worker_memory: BTreeMap<String, serde_json::Value>,
    pub saved_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn encode(&self) -> Result<String, SnapshotError> {
        serde_json::to_string(self).map_err(|e| SnapshotError::Encode(e.to_string()))
    }

    /// 先校验版本再反序列化，避免旧格式被“部分解析”
    pub fn decode(blob: &str) -> Result<Self, SnapshotError> {
        let value: serde_json::Value =
            serde_json::from_str(blob).map_err(|e| SnapshotError::Malformed(e.to_string()))?;
        let found = value
            .get("version")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| SnapshotError::Malformed("missing version".to_string()))?;
        if found != u64::from(SNAPSHOT_VERSION) {
            return Err(SnapshotError::Incompatible {
                expected: SNAPSHOT_VERSION,
                found,
            });
        }
        serde_json::from_value(value).map_err(|e| SnapshotError::Malformed(e.to_string()))
    }
}

/// 单次请求内的会话
#[derive(Debug, Clone)]
pub struct Session {
    conversation_id: String,
    messages: Vec<Message>,
    turn_count: u64,
    worker_memory: BTreeMap<String, serde_json::Value>,
    /// 本轮第一条消息在日志中的下标
    turn_start: usize,
}

impl Session {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            messages: Vec::new(),
            turn_count: 0,
            worker_memory: BTreeMap::new(),
            turn_start: 0,
        }
    }

    /// 从快照重建；快照中出现名册之外的来源或记忆即视为不兼容
    pub fn restore(
        conversation_id: &str,
        snapshot: Snapshot,
        roster: &Roster,
    ) -> Result<Self, SnapshotError> {
        if snapshot.conversation_id != conversation_id {
            return Err(SnapshotError::ConversationMismatch {
                expected: conversation_id.to_string(),
                found: snapshot.conversation_id,
            });
        }
        for msg in &snapshot.messages {
            let known = msg.source == USER_SOURCE
                || msg.source == SYSTEM_SOURCE
                || roster.contains(&msg.source);
            if !known {
                return Err(SnapshotError::UnknownWorker(msg.source.clone()));
            }
        }
        if let Some(name) = snapshot.worker_memory.keys().find(|n| !roster.contains(n)) {
            return Err(SnapshotError::UnknownWorker(name.clone()));
        }
        let turn_start = snapshot.messages.len();
        Ok(Self {
            conversation_id: snapshot.conversation_id,
            messages: snapshot.messages,
            turn_count: snapshot.turn_count,
            worker_memory: snapshot.worker_memory,
            turn_start,
        })
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn turn_count(&self) -> u64 {
        self.turn_count
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// 本轮追加的消息
    pub fn turn_messages(&self) -> &[Message] {
        &self.messages[self.turn_start..]
    }

    pub fn last_speaker(&self) -> Option<&str> {
        self.messages.last().map(|m| m.source.as_str())
    }

    pub fn worker_memory(&self, worker: &str) -> Option<&serde_json::Value> {
        self.worker_memory.get(worker)
    }

    /// 开始新一轮：按上限裁掉最旧的历史，返回本轮序号
    pub fn begin_turn(&mut self, history_limit: usize) -> u64 {
        if history_limit > 0 && self.messages.len() > history_limit {
            let excess = self.messages.len() - history_limit;
            self.messages.drain(..excess);
        }
        self.turn_start = self.messages.len();
        self.turn_count += 1;
        self.turn_count
    }

    pub fn append(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// 生成快照；`memory` 为本轮结束时各 Worker 导出的记忆，覆盖旧值
    pub fn snapshot(&self, memory: BTreeMap<String, serde_json::Value>) -> Snapshot {
        let mut worker_memory = self.worker_memory.clone();
        worker_memory.extend(memory);
        Snapshot {
            version: SNAPSHOT_VERSION,
            conversation_id: self.conversation_id.clone(),
            turn_count: self.turn_count,
            messages: self.messages.clone(),
            worker_memory,
            saved_at: Utc::now(),
        }
    }
}
