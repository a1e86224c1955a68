//! Per-entity lock table.
//!
//! Get-or-create on one logical record (a chat, a user) is serialized by a
//! lock dedicated to that record, so unrelated records never wait on each
//! other. Locks are created on first access and kept until shutdown; the
//! table only grows while the process runs.

use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Chat,
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityKey {
    pub kind: EntityKind,
    pub id: i64,
}

impl EntityKey {
    pub fn chat(id: i64) -> Self {
        Self {
            kind: EntityKind::Chat,
            id,
        }
    }

    pub fn user(id: i64) -> Self {
        Self {
            kind: EntityKind::User,
            id,
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            EntityKind::Chat => write!(f, "chat:{}", self.id),
            EntityKind::User => write!(f, "user:{}", self.id),
        }
    }
}

/// Shared handle to one entity's lock.
#[derive(Clone)]
pub struct EntityLock {
    inner: Arc<Mutex<()>>,
}

/// Held for the duration of a critical section on one entity.
pub type EntityGuard = OwnedMutexGuard<()>;

impl EntityLock {
    pub async fn acquire(&self) -> EntityGuard {
        self.inner.clone().lock_owned().await
    }

    pub fn try_acquire(&self) -> Option<EntityGuard> {
        self.inner.clone().try_lock_owned().ok()
    }
}

#[derive(Default)]
pub struct EntityLocks {
    table: DashMap<EntityKey, EntityLock>,
    dropping: AtomicBool,
}

impl EntityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock for `key`, created on first access. `None` once the table is
    /// being torn down.
    pub fn get(&self, key: EntityKey) -> Option<EntityLock> {
        if self.dropping.load(Ordering::Acquire) {
            return None;
        }

        let lock = self
            .table
            .entry(key)
            .or_insert_with(|| EntityLock {
                inner: Arc::new(Mutex::new(())),
            })
            .clone();

        Some(lock)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.dropping.load(Ordering::Acquire)
    }

    /// Stop handing out locks, wait until nobody is inside a critical
    /// section, then drop the table.
    pub async fn close(&self) {
        if self.dropping.swap(true, Ordering::AcqRel) {
            return;
        }

        let locks: Vec<EntityLock> = self.table.iter().map(|entry| entry.value().clone()).collect();
        for lock in &locks {
            drop(lock.acquire().await);
        }

        self.table.clear();
        log::info!("entity lock table released ({} locks)", locks.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_shares_lock() {
        let locks = EntityLocks::new();
        let a = locks.get(EntityKey::chat(555)).expect("lock");
        let b = locks.get(EntityKey::chat(555)).expect("lock");

        let _guard = a.acquire().await;
        assert!(b.try_acquire().is_none());
        assert_eq!(locks.len(), 1);
    }

    #[tokio::test]
    async fn test_kinds_do_not_collide() {
        let locks = EntityLocks::new();
        let chat = locks.get(EntityKey::chat(42)).expect("lock");
        let user = locks.get(EntityKey::user(42)).expect("lock");

        let _guard = chat.acquire().await;
        assert!(user.try_acquire().is_some());
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_serialize() {
        let locks = Arc::new(EntityLocks::new());
        let held = locks.get(EntityKey::chat(1)).expect("lock");
        let _guard = held.acquire().await;

        let other = locks.clone();
        let result = tokio::time::timeout(Duration::from_secs(1), async move {
            let lock = other.get(EntityKey::chat(2)).expect("lock");
            drop(lock.acquire().await);
        })
        .await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_close_waits_for_holder() {
        let locks = Arc::new(EntityLocks::new());
        let lock = locks.get(EntityKey::user(7)).expect("lock");
        let guard = lock.acquire().await;

        let closing = locks.clone();
        let close = tokio::spawn(async move { closing.close().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!close.is_finished());
        assert!(locks.get(EntityKey::user(8)).is_none());

        drop(guard);
        close.await.expect("close task");
        assert!(locks.is_empty());
        assert!(locks.is_closed());
    }
}
