//! Lock manager — named asynchronous mutexes with a global acquisition order.
//!
//! DESIGN
//! ======
//! Each `LockKey` maps to a fair (FIFO) `tokio::sync::Mutex`. Entries are
//! created on first request and removed when the last holder releases with
//! nobody queued, so the table only holds keys that are in use.
//!
//! A multi-step request acquires through a `LockSet`, which enforces the
//! canvas → user → action(s) → tile order and releases everything in reverse
//! order when dropped. Any two requests that need overlapping keys therefore
//! queue on them in the same relative order and cannot deadlock, and no exit
//! path (error, early return, cancelled future) can leak a held lock.
//!
//! `LockKey` derives `Ord` in exactly that order: variants rank by declaration,
//! action ids ascend oldest-first, and tiles ascend column-major.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::OwnedMutexGuard;
use tracing::trace;

use crate::geometry::{Region, TileLocation};
use crate::model::{ActionId, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockKey {
    Canvas,
    User(UserId),
    Action(ActionId),
    Tile(TileLocation),
}

// =============================================================================
// LOCK MANAGER
// =============================================================================

#[derive(Clone, Default)]
pub struct LockManager {
    inner: Arc<LockTable>,
}

#[derive(Default)]
struct LockTable {
    entries: Mutex<HashMap<LockKey, Arc<tokio::sync::Mutex<()>>>>,
    acquisitions: AtomicU64,
}

impl LockTable {
    fn entries(&self) -> MutexGuard<'_, HashMap<LockKey, Arc<tokio::sync::Mutex<()>>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl LockManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until `key` is free and take it. Released when the guard drops.
    pub async fn acquire(&self, key: LockKey) -> LockGuard {
        let mutex = Arc::clone(self.inner.entries().entry(key.clone()).or_default());
        self.inner.acquisitions.fetch_add(1, Ordering::Relaxed);
        let guard = mutex.lock_owned().await;
        trace!(?key, "lock acquired");
        LockGuard { key, guard: Some(guard), table: Arc::clone(&self.inner) }
    }

    /// Total number of acquisitions requested since start.
    #[must_use]
    pub fn acquisitions(&self) -> u64 {
        self.inner.acquisitions.load(Ordering::Relaxed)
    }

    /// Number of keys currently held or waited on.
    #[must_use]
    pub fn active_keys(&self) -> usize {
        self.inner.entries().len()
    }
}

/// Holds one named lock until dropped.
pub struct LockGuard {
    key: LockKey,
    guard: Option<OwnedMutexGuard<()>>,
    table: Arc<LockTable>,
}

impl LockGuard {
    #[must_use]
    pub fn key(&self) -> &LockKey {
        &self.key
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // Release under the table lock so no new waiter can clone the entry
        // between the release and the emptiness check.
        let mut entries = self.table.entries();
        drop(self.guard.take());
        if let Some(mutex) = entries.get(&self.key) {
            if Arc::strong_count(mutex) == 1 {
                entries.remove(&self.key);
            }
        }
        trace!(key = ?self.key, "lock released");
    }
}

// =============================================================================
// LOCK SET
// =============================================================================

/// The locks held by one logical operation, acquired in global order.
pub struct LockSet {
    manager: LockManager,
    guards: Vec<LockGuard>,
}

impl LockSet {
    #[must_use]
    pub fn new(manager: &LockManager) -> Self {
        Self { manager: manager.clone(), guards: Vec::new() }
    }

    pub async fn canvas(&mut self) {
        self.push(LockKey::Canvas).await;
    }

    pub async fn user(&mut self, user_id: UserId) {
        self.push(LockKey::User(user_id)).await;
    }

    pub async fn action(&mut self, action_id: ActionId) {
        self.push(LockKey::Action(action_id)).await;
    }

    pub async fn tile(&mut self, location: &TileLocation) {
        self.push(LockKey::Tile(location.clone())).await;
    }

    /// Lock every tile of `region`. The grouping is not atomic, but every tile
    /// is held before this returns.
    pub async fn region(&mut self, region: &Region) {
        let mut keys: Vec<LockKey> = region.iter().cloned().map(LockKey::Tile).collect();
        keys.sort();
        for key in keys {
            self.push(key).await;
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.guards.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }

    async fn push(&mut self, key: LockKey) {
        if let Some(last) = self.guards.last() {
            if self.guards.iter().any(|g| g.key() == &key) {
                return;
            }
            debug_assert!(last.key() < &key, "lock order violation: {:?} requested after {:?}", key, last.key());
        }
        let guard = self.manager.acquire(key).await;
        self.guards.push(guard);
    }
}

impl Drop for LockSet {
    fn drop(&mut self) {
        while let Some(guard) = self.guards.pop() {
            drop(guard);
        }
    }
}

#[cfg(test)]
#[path = "lock_test.rs"]
mod tests;
