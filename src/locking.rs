//! 按上传会话划分的内存读写锁。
//!
//! 分片写入持有共享锁，完整性判断与合并持有独占锁，
//! 因此同一会话的不同分片可以并行写入，而合并至多执行一次。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tokio::time;

/// 获取锁超时。
#[derive(Debug)]
pub struct LockTimeout;

/// Manages asynchronous read/write locks keyed by upload id.
#[derive(Debug, Default)]
pub struct LockManager {
    locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn entry(&self, key: &str) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// 在超时时间内获取共享锁。
    pub async fn shared(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<OwnedRwLockReadGuard<()>, LockTimeout> {
        let lock = self.entry(key).await;
        time::timeout(timeout, lock.read_owned())
            .await
            .map_err(|_| LockTimeout)
    }

    /// 在超时时间内获取独占锁。
    pub async fn exclusive(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<OwnedRwLockWriteGuard<()>, LockTimeout> {
        let lock = self.entry(key).await;
        time::timeout(timeout, lock.write_owned())
            .await
            .map_err(|_| LockTimeout)
    }

    /// 立即尝试获取独占锁，被占用时返回 None。
    pub async fn try_exclusive(&self, key: &str) -> Option<OwnedRwLockWriteGuard<()>> {
        self.entry(key).await.try_write_owned().ok()
    }

    /// 移除无人持有的锁条目，返回移除数量。
    pub async fn prune_idle(&self) -> usize {
        let mut locks = self.locks.lock().await;
        let before = locks.len();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - locks.len()
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::LockManager;
    use std::time::Duration;

    #[tokio::test]
    async fn shared_locks_coexist_but_block_exclusive() {
        let manager = LockManager::new();
        let wait = Duration::from_millis(50);
        let first = manager.shared("up", wait).await.expect("first shared");
        let second = manager.shared("up", wait).await.expect("second shared");

        assert!(manager.exclusive("up", wait).await.is_err());
        assert!(manager.try_exclusive("up").await.is_none());
        assert!(manager.exclusive("other", wait).await.is_ok());

        drop(first);
        drop(second);
        assert!(manager.exclusive("up", wait).await.is_ok());
    }

    #[tokio::test]
    async fn prune_keeps_held_locks() {
        let manager = LockManager::new();
        let held = manager
            .exclusive("held", Duration::from_millis(50))
            .await
            .expect("lock");
        drop(
            manager
                .exclusive("idle", Duration::from_millis(50))
                .await
                .expect("lock"),
        );

        assert_eq!(manager.prune_idle().await, 1);
        assert_eq!(manager.len().await, 1);
        drop(held);
        assert_eq!(manager.prune_idle().await, 1);
    }
}
