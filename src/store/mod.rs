//! 会话快照存储抽象层
//!
//! 按会话 ID 点查 / 覆盖写一个不透明的快照文本（last-writer-wins），不提供跨会话事务。
//! 支持内存与 SQLite（feature `async-sqlite`）两种实现。

mod memory;
#[cfg(feature = "async-sqlite")]
mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::StoreSection;

pub use memory::MemorySessionStore;
#[cfg(feature = "async-sqlite")]
pub use sqlite::SqliteSessionStore;

/// 存储后端错误
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store backend unavailable: {0}")]
    Unavailable(String),

    #[error("store query failed: {0}")]
    Query(String),
}

/// 快照存储接口
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// 读取会话快照；不存在时返回 None
    async fn load(&self, conversation_id: &str) -> Result<Option<String>, StoreError>;

    /// 覆盖写入会话快照
    async fn save(&self, conversation_id: &str, snapshot: &str) -> Result<(), StoreError>;

    /// 删除会话快照（不存在时不报错）
    async fn delete(&self, conversation_id: &str) -> Result<(), StoreError>;
}

/// 创建快照存储
///
/// backend = "sqlite" 且启用了 async-sqlite feature 时使用 SQLite；否则使用内存存储
pub async fn create_session_store(section: &StoreSection) -> Arc<dyn SessionStore> {
    #[cfg(feature = "async-sqlite")]
    if section.backend == "sqlite" {
        match SqliteSessionStore::new(&section.sqlite_path).await {
            Ok(store) => {
                tracing::info!("Using sqlite session store: {:?}", section.sqlite_path);
                return Arc::new(store);
            }
            Err(e) => {
                tracing::warn!("Failed to open sqlite session store, falling back to memory: {}", e);
            }
        }
    }

    #[cfg(not(feature = "async-sqlite"))]
    if section.backend == "sqlite" {
        tracing::warn!("sqlite session store requested but async-sqlite feature not enabled, using memory store");
    }

    tracing::info!("Using in-memory session store");
    Arc::new(MemorySessionStore::new())
}
