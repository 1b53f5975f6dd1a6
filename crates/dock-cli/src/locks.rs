//! Per-key async mutexes.
//!
//! Each key maps to its own `Arc<Mutex<()>>` in a `DashMap`; there is no
//! global lock, so snapshots touching disjoint keys never wait on each other.

use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

pub type SharedKeyLock = Arc<Mutex<()>>;

pub struct KeyLocks<K> {
    locks: DashMap<K, SharedKeyLock>,
}

impl<K> Default for KeyLocks<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Holds one key exclusively until dropped.
pub struct KeyGuard {
    _guard: OwnedMutexGuard<()>,
}

impl<K> KeyLocks<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, key: &K) -> SharedKeyLock {
        // Clone out of the shard before awaiting.
        self.locks.entry(key.clone()).or_default().clone()
    }

    /// Wait up to `timeout` for exclusive access to `key`.
    /// `None` means the wait timed out.
    pub async fn acquire(&self, key: &K, timeout: Duration) -> Option<KeyGuard> {
        let lock = self.lock_for(key);
        tokio::time::timeout(timeout, lock.lock_owned())
            .await
            .ok()
            .map(|guard| KeyGuard { _guard: guard })
    }

    /// Drop entries nobody holds or waits on.
    pub fn prune(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
