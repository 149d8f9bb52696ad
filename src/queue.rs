//! Rate-limited work queue.
//!
//! Keys (`namespace/name`) are deduplicated while queued and while in flight:
//! adding a key that is currently being processed marks it dirty and requeues
//! it once the worker calls [`WorkQueue::done`], so a burst of watch events
//! collapses into at most one pending reconciliation per key. Failed keys are
//! re-added through a per-key exponential backoff.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};

/// Initial delay for a key's first retry.
pub const DEFAULT_BACKOFF_START_MS: u64 = 1_000;
/// Upper bound on the per-key retry delay.
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;

#[derive(Debug, Default)]
struct QueueState {
    /// Keys ready to be handed to a worker, in arrival order.
    queue: VecDeque<String>,
    /// Keys either queued or in flight. Membership here is what deduplicates.
    dirty: HashSet<String>,
    /// Keys currently held by a worker.
    processing: HashSet<String>,
    /// Consecutive failure count per key, for the rate limiter.
    failures: HashMap<String, u32>,
    shutting_down: bool,
}

/// Deduplicating work queue with per-key exponential retry backoff.
#[derive(Debug)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    backoff_start: Duration,
    backoff_max: Duration,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::with_backoff(
            Duration::from_millis(DEFAULT_BACKOFF_START_MS),
            Duration::from_millis(DEFAULT_BACKOFF_MAX_MS),
        )
    }

    pub fn with_backoff(backoff_start: Duration, backoff_max: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            backoff_start,
            backoff_max,
        }
    }

    /// Enqueue a key. No-op if the key is already queued; if the key is in
    /// flight it is marked dirty and requeued when its worker finishes.
    pub async fn add(&self, key: &str) {
        let mut state = self.state.lock().await;
        if state.shutting_down || state.dirty.contains(key) {
            return;
        }
        state.dirty.insert(key.to_string());
        // In-flight keys are only marked; done() requeues them.
        if !state.processing.contains(key) {
            state.queue.push_back(key.to_string());
            self.notify.notify_one();
        }
    }

    /// Wait for the next key. Returns `None` once the queue is shut down and
    /// drained, which is the worker's signal to exit.
    pub async fn get(&self) -> Option<String> {
        loop {
            {
                let mut state = self.state.lock().await;
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Mark a key's processing as finished. If the key went dirty while in
    /// flight it is immediately requeued.
    pub async fn done(&self, key: &str) {
        let mut state = self.state.lock().await;
        state.processing.remove(key);
        if state.dirty.contains(key) {
            if state.shutting_down {
                state.dirty.remove(key);
            } else {
                state.queue.push_back(key.to_string());
                self.notify.notify_one();
            }
        }
    }

    /// Re-enqueue a failed key after its backoff delay. The delay doubles
    /// with each consecutive failure of the same key, bounded by the cap.
    pub async fn add_rate_limited(self: &Arc<Self>, key: &str) {
        let delay = {
            let mut state = self.state.lock().await;
            if state.shutting_down {
                return;
            }
            let failures = state.failures.entry(key.to_string()).or_insert(0);
            let delay = self
                .backoff_start
                .saturating_mul(1u32 << (*failures).min(16))
                .min(self.backoff_max);
            *failures += 1;
            delay
        };
        let queue = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key).await;
        });
    }

    /// Clear a key's failure history after a successful reconciliation.
    pub async fn forget(&self, key: &str) {
        self.state.lock().await.failures.remove(key);
    }

    /// Stop accepting new keys and wake all waiting workers. Keys already
    /// queued are still handed out so in-progress work drains cleanly.
    pub async fn shut_down(&self) {
        self.state.lock().await.shutting_down = true;
        self.notify.notify_waiters();
        // A worker parked between the state check and the wait still gets
        // through on its next permit.
        self.notify.notify_one();
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Current consecutive-failure count for a key.
    pub async fn retries(&self, key: &str) -> u32 {
        self.state.lock().await.failures.get(key).copied().unwrap_or(0)
    }
}

impl WorkQueue {
    /// Compute the backoff delay for the given failure count without mutating
    /// queue state.
    pub fn backoff_for(&self, failures: u32) -> Duration {
        self.backoff_start
            .saturating_mul(1u32 << failures.min(16))
            .min(self.backoff_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn adds_are_deduplicated_while_queued() {
        let queue = WorkQueue::new();
        queue.add("ns/a").await;
        queue.add("ns/a").await;
        queue.add("ns/a").await;
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn dirty_key_requeues_after_done() {
        let queue = WorkQueue::new();
        queue.add("ns/a").await;
        let key = queue.get().await.unwrap();
        assert_eq!(key, "ns/a");
        assert_eq!(queue.len().await, 0);

        // Arrives while in flight: must not be lost, must not run twice
        // concurrently.
        queue.add("ns/a").await;
        assert_eq!(queue.len().await, 0);

        queue.done("ns/a").await;
        assert_eq!(queue.len().await, 1);
        assert_eq!(queue.get().await.unwrap(), "ns/a");
    }

    #[tokio::test]
    async fn clean_done_does_not_requeue() {
        let queue = WorkQueue::new();
        queue.add("ns/a").await;
        let key = queue.get().await.unwrap();
        queue.done(&key).await;
        assert_eq!(queue.len().await, 0);
    }

    #[tokio::test]
    async fn get_returns_none_after_shutdown() {
        let queue = Arc::new(WorkQueue::new());
        queue.add("ns/a").await;
        queue.shut_down().await;
        // Queued keys still drain.
        assert_eq!(queue.get().await.as_deref(), Some("ns/a"));
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test]
    async fn shutdown_rejects_new_keys() {
        let queue = WorkQueue::new();
        queue.shut_down().await;
        queue.add("ns/a").await;
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test]
    async fn backoff_doubles_and_caps() {
        let queue = WorkQueue::new();
        assert_eq!(queue.backoff_for(0), Duration::from_secs(1));
        assert_eq!(queue.backoff_for(1), Duration::from_secs(2));
        assert_eq!(queue.backoff_for(4), Duration::from_secs(16));
        assert_eq!(queue.backoff_for(10), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_add_lands_after_delay() {
        let queue = Arc::new(WorkQueue::new());
        queue.add_rate_limited("ns/a").await;
        assert_eq!(queue.len().await, 0);
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        tokio::task::yield_now().await;
        assert_eq!(queue.len().await, 1);
        assert_eq!(queue.retries("ns/a").await, 1);

        queue.forget("ns/a").await;
        assert_eq!(queue.retries("ns/a").await, 0);
    }
}
