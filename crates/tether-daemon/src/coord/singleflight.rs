//! Keyed in-flight call collapsing.
//!
//! Concurrent calls for the same key share one future and all settle with
//! the same (cloned) output. The entry is evicted as soon as the shared
//! future completes; an optional TTL bounds how long an entry may be joined,
//! so a wedged operation cannot capture every later caller.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::Mutex;
use tracing::debug;

struct Entry<T: Clone> {
    id: u64,
    started_at: Instant,
    future: Shared<BoxFuture<'static, T>>,
}

/// Collapses concurrent same-key calls into one shared operation.
pub struct SingleFlight<K, T: Clone> {
    inflight: Arc<Mutex<HashMap<K, Entry<T>>>>,
    next_id: AtomicU64,
    ttl: Option<Duration>,
}

impl<K, T> SingleFlight<K, T>
where
    K: Eq + Hash + Clone + std::fmt::Debug + Send + 'static,
    T: Clone + Send + Sync + 'static,
{
    /// Entries are joinable for as long as they run.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Entries older than `ttl` are no longer joined; a fresh call starts instead.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self::build(Some(ttl))
    }

    fn build(ttl: Option<Duration>) -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
            ttl,
        }
    }

    /// Run `make()` for `key`, or join the call already in flight for it.
    pub async fn run<F, Fut>(&self, key: K, make: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (id, future) = {
            let mut inflight = self.inflight.lock().await;
            let joinable = inflight.get(&key).filter(|entry| {
                self.ttl
                    .is_none_or(|ttl| entry.started_at.elapsed() < ttl)
            });
            if let Some(entry) = joinable {
                debug!(?key, "joining in-flight operation");
                (entry.id, entry.future.clone())
            } else {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let future = make().boxed().shared();
                inflight.insert(
                    key.clone(),
                    Entry {
                        id,
                        started_at: Instant::now(),
                        future: future.clone(),
                    },
                );
                (id, future)
            }
        };

        let output = future.await;

        let mut inflight = self.inflight.lock().await;
        if inflight.get(&key).is_some_and(|entry| entry.id == id) {
            inflight.remove(&key);
        }
        output
    }

    /// Number of keys with an operation currently registered.
    pub async fn in_flight(&self) -> usize {
        self.inflight.lock().await.len()
    }
}

impl<K, T> Default for SingleFlight<K, T>
where
    K: Eq + Hash + Clone + std::fmt::Debug + Send + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
