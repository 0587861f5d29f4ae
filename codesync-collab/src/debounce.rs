//! Debounced side-effect scheduler.
//!
//! One pending timer per `(document key, client)` pair. Scheduling a new
//! action replaces (and aborts) the pending one, so only the most recent
//! edit's action can fire.
//!
//! ```text
//!  edit ─► schedule ─► [sleep(delay)] ─► claim slot ─► action().await
//!  edit ─► schedule ──abort──┘              │
//!                                 generation mismatch → drop
//! ```
//!
//! A timer claims its slot under the lock before running its action. Once
//! claimed it is no longer reachable by `schedule`/`cancel` and runs to
//! completion.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::AbortHandle;

use crate::protocol::ClientId;

/// Default debounce delay.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

type TimerKey = (String, ClientId);

struct PendingTimer {
    generation: u64,
    handle: AbortHandle,
}

/// Per-key debounce timers.
pub struct DebounceScheduler {
    delay: Duration,
    timers: Arc<Mutex<HashMap<TimerKey, PendingTimer>>>,
    next_generation: AtomicU64,
}

impl DebounceScheduler {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            timers: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Run `action` after the delay unless superseded first.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule<F, Fut>(&self, doc_key: &str, client_id: ClientId, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let key: TimerKey = (doc_key.to_string(), client_id);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let delay = self.delay;
        let timers = self.timers.clone();
        let task_key = key.clone();

        // Hold the map lock across spawn so the entry exists before the
        // task can try to claim it.
        let mut pending = self.timers.lock();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let claimed = {
                let mut timers = timers.lock();
                match timers.get(&task_key) {
                    Some(timer) if timer.generation == generation => {
                        timers.remove(&task_key);
                        true
                    }
                    _ => false,
                }
            };
            if claimed {
                action().await;
            }
        })
        .abort_handle();

        if let Some(previous) = pending.insert(key, PendingTimer { generation, handle }) {
            previous.handle.abort();
            log::trace!("Superseded debounce timer for client {client_id} on {doc_key}");
        }
    }

    /// Cancel the pending timer for a key. Returns `true` if one was pending.
    pub fn cancel(&self, doc_key: &str, client_id: ClientId) -> bool {
        let removed = self
            .timers
            .lock()
            .remove(&(doc_key.to_string(), client_id));
        match removed {
            Some(timer) => {
                timer.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self, doc_key: &str, client_id: ClientId) -> bool {
        self.timers
            .lock()
            .contains_key(&(doc_key.to_string(), client_id))
    }

    /// Number of timers that have not fired yet.
    pub fn pending(&self) -> usize {
        self.timers.lock().len()
    }

    /// Abort every pending timer.
    pub fn cancel_all(&self) {
        for (_, timer) in self.timers.lock().drain() {
            timer.handle.abort();
        }
    }
}

impl Default for DebounceScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE)
    }
}
