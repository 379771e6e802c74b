//! Webhook 去重
//!
//! - 处理中的 message id 持有租约（lease），同一进程内同一 id 最多一个编排
//! - 成功处理后的 id 在 TTL 内仍视为重复，迟到的重投也是 no-op
//! - 失败的处理不记为完成，上游重投时可以重试
//! - 租约在 drop 时释放（包括 panic 展开），不需要调用方记得清理
//!
//! 状态只在进程内；多实例部署需要换成共享存储实现 `LeaseStore`。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// 已完成 id 的上限，超出时清空最旧的一半
const MAX_COMPLETED: usize = 10_000;

/// 租约存储
pub trait LeaseStore: Send + Sync {
    /// 原子的 test-and-set；处理中或近期已完成时返回 false
    fn try_acquire(&self, key: &str) -> bool;

    /// 释放租约；`completed` 为 true 时在 TTL 内拒绝同一 id
    fn release(&self, key: &str, completed: bool);

    fn in_flight(&self) -> usize;
}

#[derive(Default)]
struct LeaseState {
    in_flight: HashSet<String>,
    completed: HashMap<String, Instant>,
}

/// 进程内租约存储
pub struct InMemoryLeaseStore {
    state: Mutex<LeaseState>,
    completed_ttl: Duration,
}

impl InMemoryLeaseStore {
    pub fn new(completed_ttl: Duration) -> Self {
        Self {
            state: Mutex::new(LeaseState::default()),
            completed_ttl,
        }
    }

    fn state(&self) -> MutexGuard<'_, LeaseState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl LeaseStore for InMemoryLeaseStore {
    fn try_acquire(&self, key: &str) -> bool {
        let mut state = self.state();
        let ttl = self.completed_ttl;
        state.completed.retain(|_, at| at.elapsed() < ttl);
        if state.completed.contains_key(key) || state.in_flight.contains(key) {
            return false;
        }
        state.in_flight.insert(key.to_string())
    }

    fn release(&self, key: &str, completed: bool) {
        let mut state = self.state();
        state.in_flight.remove(key);
        if completed && !self.completed_ttl.is_zero() {
            if state.completed.len() >= MAX_COMPLETED {
                let mut by_age: Vec<(String, Instant)> = state.completed.drain().collect();
                by_age.sort_by_key(|(_, at)| *at);
                state.completed = by_age.into_iter().skip(MAX_COMPLETED / 2).collect();
            }
            state.completed.insert(key.to_string(), Instant::now());
        }
    }

    fn in_flight(&self) -> usize {
        self.state().in_flight.len()
    }
}

/// 去重入口
#[derive(Clone)]
pub struct DedupGuard {
    store: Arc<dyn LeaseStore>,
}

impl DedupGuard {
    pub fn new(store: Arc<dyn LeaseStore>) -> Self {
        Self { store }
    }

    pub fn in_memory(completed_ttl: Duration) -> Self {
        Self::new(Arc::new(InMemoryLeaseStore::new(completed_ttl)))
    }

    /// 取得租约；重复投递返回 None
    pub fn acquire(&self, message_id: &str) -> Option<DedupLease> {
        if self.store.try_acquire(message_id) {
            Some(DedupLease {
                key: message_id.to_string(),
                store: Arc::clone(&self.store),
                completed: false,
            })
        } else {
            None
        }
    }

    pub fn in_flight(&self) -> usize {
        self.store.in_flight()
    }
}

/// 处理中的租约；drop 时释放
pub struct DedupLease {
    key: String,
    store: Arc<dyn LeaseStore>,
    completed: bool,
}

impl DedupLease {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// 处理成功（或确定无需处理），释放后在 TTL 内拒绝重投
    pub fn mark_completed(&mut self) {
        self.completed = true;
    }
}

impl Drop for DedupLease {
    fn drop(&mut self) {
        self.store.release(&self.key, self.completed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_is_rejected_while_in_flight() {
        let guard = DedupGuard::in_memory(Duration::from_secs(60));
        let lease = guard.acquire("m1").unwrap();
        assert!(guard.acquire("m1").is_none());
        assert!(guard.acquire("m2").is_some());
        assert_eq!(guard.in_flight(), 1);
        drop(lease);
        assert_eq!(guard.in_flight(), 0);
    }

    #[test]
    fn test_failed_processing_allows_retry() {
        let guard = DedupGuard::in_memory(Duration::from_secs(60));
        drop(guard.acquire("m1").unwrap());
        assert!(guard.acquire("m1").is_some());
    }

    #[test]
    fn test_completed_rejects_within_ttl() {
        let guard = DedupGuard::in_memory(Duration::from_secs(60));
        let mut lease = guard.acquire("m1").unwrap();
        lease.mark_completed();
        drop(lease);
        assert!(guard.acquire("m1").is_none());
    }

    #[test]
    fn test_completed_expires() {
        let guard = DedupGuard::in_memory(Duration::ZERO);
        let mut lease = guard.acquire("m1").unwrap();
        lease.mark_completed();
        drop(lease);
        assert!(guard.acquire("m1").is_some());
    }

    #[test]
    fn test_lease_released_on_panic() {
        let guard = DedupGuard::in_memory(Duration::from_secs(60));
        let inner = guard.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _lease = inner.acquire("m1").unwrap();
            panic!("worker blew up");
        }));
        assert!(result.is_err());
        assert_eq!(guard.in_flight(), 0);
        assert!(guard.acquire("m1").is_some());
    }

    #[test]
    fn test_concurrent_acquire_yields_one_lease() {
        let guard = DedupGuard::in_memory(Duration::from_secs(60));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let guard = guard.clone();
                std::thread::spawn(move || {
                    let lease = guard.acquire("same");
                    std::thread::sleep(Duration::from_millis(20));
                    lease.map(|mut l| l.mark_completed()).is_some()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
