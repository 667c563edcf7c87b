//! Advisory in-process mutex keyed by an arbitrary value.
//!
//! Used to serialise worktree mutations per `(origin, branch)`. A key's slot
//! exists only while someone holds or waits on it.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Map of per-key async mutexes.
pub struct KeyedLock<K> {
    slots: Arc<Mutex<HashMap<K, Arc<Mutex<()>>>>>,
}

/// Held lock for one key; releasing it drops the slot when nobody else waits.
pub struct KeyedGuard<K: Eq + Hash + Clone + Send + 'static> {
    key: K,
    slot: Arc<Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
    slots: Arc<Mutex<HashMap<K, Arc<Mutex<()>>>>>,
}

impl<K: Eq + Hash + Clone + Send + 'static> KeyedLock<K> {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: K) -> KeyedGuard<K> {
        let slot = {
            let mut slots = self.slots.lock().await;
            Arc::clone(slots.entry(key.clone()).or_default())
        };
        let guard = Arc::clone(&slot).lock_owned().await;
        KeyedGuard {
            key,
            slot,
            guard: Some(guard),
            slots: Arc::clone(&self.slots),
        }
    }

    /// Number of keys currently held or awaited.
    pub async fn active_keys(&self) -> usize {
        self.slots.lock().await.len()
    }
}

impl<K: Eq + Hash + Clone + Send + 'static> Default for KeyedLock<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone + Send + 'static> Drop for KeyedGuard<K> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let slots = Arc::clone(&self.slots);
        let key = self.key.clone();
        let slot = Arc::clone(&self.slot);
        // Eviction needs the async map lock; try inline first, else defer.
        if let Ok(mut map) = slots.try_lock() {
            evict_if_idle(&mut map, &key, &slot);
        } else if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let mut map = slots.lock().await;
                evict_if_idle(&mut map, &key, &slot);
            });
        }
    }
}

fn evict_if_idle<K: Eq + Hash>(map: &mut HashMap<K, Arc<Mutex<()>>>, key: &K, slot: &Arc<Mutex<()>>) {
    // The map and this guard hold the only references: nobody is waiting.
    let idle = map
        .get(key)
        .is_some_and(|current| Arc::ptr_eq(current, slot) && Arc::strong_count(slot) == 2);
    if idle {
        map.remove(key);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_is_serialised() {
        let lock = Arc::new(KeyedLock::new());
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            let active = Arc::clone(&active);
            let max_seen = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                let _guard = lock.lock(("/origin".to_string(), "feat".to_string())).await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let lock = KeyedLock::new();
        let _a = lock.lock("a").await;
        let b = tokio::time::timeout(Duration::from_millis(100), lock.lock("b")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn slot_removed_after_release() {
        let lock = KeyedLock::new();
        {
            let _guard = lock.lock("k").await;
            assert_eq!(lock.active_keys().await, 1);
        }
        tokio::task::yield_now().await;
        assert_eq!(lock.active_keys().await, 0);
    }
}
