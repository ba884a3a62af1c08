//! Keyed exclusive regions.
//!
//! One region per aggregate id: callers on the same key are serialized,
//! callers on different keys never wait for each other. Regions nest only in
//! the order graph -> task -> variable.

use dashmap::DashMap;
use dispatchcore::{GraphId, TaskId, VariableId};
use parking_lot::RwLock;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Map of per-key mutexes with reference-counted eviction.
///
/// An entry lives while a guard or a waiter holds it and is removed when
/// the last guard is dropped.
pub struct KeyedLock<K>
where
    K: Eq + Hash + Clone,
{
    slots: Arc<DashMap<K, Arc<Mutex<()>>>>,
}

impl<K> KeyedLock<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
        }
    }

    pub async fn acquire(&self, key: K) -> KeyedGuard<K> {
        let slot = self
            .slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = slot.lock_owned().await;
        KeyedGuard {
            key,
            guard: Some(guard),
            slots: Arc::clone(&self.slots),
        }
    }

    /// Runs `f` inside the region of `key`. The region is released on every
    /// exit path, including a panic in `f`.
    pub async fn with_exclusive<T, F>(&self, key: K, f: F) -> T
    where
        F: FnOnce() -> T,
    {
        let _guard = self.acquire(key).await;
        f()
    }

    /// Async variant of [`with_exclusive`](Self::with_exclusive).
    pub async fn with_exclusive_async<T, F, Fut>(&self, key: K, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.acquire(key).await;
        f().await
    }

    pub fn is_locked(&self, key: &K) -> bool {
        self.slots
            .get(key)
            .map_or(false, |slot| slot.try_lock().is_err())
    }

    /// Number of keys with a live region.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl<K> Default for KeyedLock<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

pub struct KeyedGuard<K>
where
    K: Eq + Hash + Clone,
{
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
    slots: Arc<DashMap<K, Arc<Mutex<()>>>>,
}

impl<K> KeyedGuard<K>
where
    K: Eq + Hash + Clone,
{
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K> Drop for KeyedGuard<K>
where
    K: Eq + Hash + Clone,
{
    fn drop(&mut self) {
        // unlock first so that the guard's own Arc is released
        drop(self.guard.take());
        self.slots
            .remove_if(&self.key, |_, slot| Arc::strong_count(slot) == 1);
    }
}

/// The three region families of the dispatcher.
#[derive(Default)]
pub struct SyncLayer {
    pub graphs: KeyedLock<GraphId>,
    pub tasks: KeyedLock<TaskId>,
    pub variables: KeyedLock<VariableId>,
}

impl SyncLayer {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Read-mostly cell with an optimistic read path.
///
/// Writers bump `stamp` to odd before writing and back to even after. A
/// reader tries a non-blocking read and keeps the result only if the stamp
/// was even and unchanged; otherwise it falls back to a blocking read.
pub struct StampedLock<T> {
    stamp: AtomicU64,
    value: RwLock<T>,
}

impl<T> StampedLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            stamp: AtomicU64::new(0),
            value: RwLock::new(value),
        }
    }

    pub fn read_with<R, F>(&self, f: F) -> R
    where
        F: Fn(&T) -> R,
    {
        let stamp = self.stamp.load(Ordering::Acquire);
        if stamp % 2 == 0 {
            if let Some(value) = self.value.try_read() {
                let result = f(&value);
                if self.stamp.load(Ordering::Acquire) == stamp {
                    return result;
                }
            }
        }
        f(&self.value.read())
    }

    pub fn write_with<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&mut T) -> R,
    {
        let mut value = self.value.write();
        self.stamp.fetch_add(1, Ordering::AcqRel);
        let result = f(&mut value);
        self.stamp.fetch_add(1, Ordering::AcqRel);
        result
    }

    /// Even values mean no write is in progress.
    pub fn stamp(&self) -> u64 {
        self.stamp.load(Ordering::Acquire)
    }
}
