//! 内存快照存储（单实例部署 / 测试用，进程重启即丢失）

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{SessionStore, StoreError};

#[derive(Debug, Default)]
pub struct MemorySessionStore {
    snapshots: RwLock<HashMap<String, String>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.snapshots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.snapshots.read().await.is_empty()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, conversation_id: &str) -> Result<Option<String>, StoreError> {
        Ok(self.snapshots.read().await.get(conversation_id).cloned())
    }

    async fn save(&self, conversation_id: &str, snapshot: &str) -> Result<(), StoreError> {
        self.snapshots
            .write()
            .await
            .insert(conversation_id.to_string(), snapshot.to_string());
        Ok(())
    }

    async fn delete(&self, conversation_id: &str) -> Result<(), StoreError> {
        self.snapshots.write().await.remove(conversation_id);
        Ok(())
    }
}
