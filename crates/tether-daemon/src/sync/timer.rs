//! Flush timer: a single owned timer handle with explicit states.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Default)]
enum TimerState {
    #[default]
    Idle,
    Scheduled {
        generation: u64,
        deadline: Instant,
        handle: JoinHandle<()>,
    },
}

/// Holds at most one pending flush.
///
/// Scheduling while a flush is pending keeps the earlier deadline. The timer
/// returns to idle before the flush body runs, so the body may schedule its
/// own follow-up.
#[derive(Debug, Default)]
pub struct FlushTimer {
    state: Arc<Mutex<TimerState>>,
    generation: std::sync::atomic::AtomicU64,
}

impl FlushTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `fire` after `delay`. Returns `false` when an earlier (or
    /// equal) deadline is already pending.
    pub async fn schedule<F>(&self, delay: Duration, fire: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let deadline = Instant::now() + delay;
        let mut state = self.state.lock().await;
        if let TimerState::Scheduled {
            deadline: pending,
            handle,
            ..
        } = &*state
        {
            if *pending <= deadline {
                return false;
            }
            handle.abort();
        }

        let generation = self
            .generation
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let slot = Arc::clone(&self.state);
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            {
                let mut state = slot.lock().await;
                match &*state {
                    TimerState::Scheduled { generation: g, .. } if *g == generation => {
                        *state = TimerState::Idle;
                    }
                    _ => return,
                }
            }
            fire.await;
        });
        *state = TimerState::Scheduled {
            generation,
            deadline,
            handle,
        };
        true
    }

    /// Drop any pending flush. A flush body already running is unaffected.
    pub async fn cancel(&self) {
        let mut state = self.state.lock().await;
        if let TimerState::Scheduled { handle, .. } = std::mem::take(&mut *state) {
            handle.abort();
        }
    }

    pub async fn is_scheduled(&self) -> bool {
        matches!(*self.state.lock().await, TimerState::Scheduled { .. })
    }
}
