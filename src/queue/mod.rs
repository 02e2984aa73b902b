//! Rate-limited work queue
//!
//! A deduplicating queue of string keys with the semantics controllers rely
//! on:
//!
//! - a key that is already pending is not queued twice
//! - a key that is being processed is never handed to a second worker; if it
//!   is added meanwhile it is queued again once [`RateLimitingQueue::done`]
//!   is called
//! - failed keys are re-added after a per-key exponential delay
//!
//! ```text
//!  add ──▶ dirty? ──no──▶ processing? ──no──▶ queue ──get──▶ processing
//!                               │yes                              │
//!                               └──── re-queued on done ◀─────────┘
//! ```

mod rate_limiter;

pub use rate_limiter::{ItemExponentialBackoff, RateLimiter};

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

#[derive(Debug, Default)]
struct QueueState {
    /// Keys waiting to be handed out, in order
    queue: VecDeque<String>,
    /// Keys that need processing (queued, or re-added while processing)
    dirty: HashSet<String>,
    /// Keys currently handed out to a worker
    processing: HashSet<String>,
    shutting_down: bool,
}

struct Inner {
    name: String,
    state: Mutex<QueueState>,
    notify: Notify,
    limiter: Box<dyn RateLimiter>,
}

/// Deduplicating, rate-limited work queue.
///
/// Cloning is cheap; all clones share the same queue.
#[derive(Clone)]
pub struct RateLimitingQueue {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RateLimitingQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitingQueue")
            .field("name", &self.inner.name)
            .field("len", &self.len())
            .finish()
    }
}

impl RateLimitingQueue {
    /// Create a queue using the given rate limiter for retries
    pub fn new(name: impl Into<String>, limiter: impl RateLimiter + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                limiter: Box::new(limiter),
            }),
        }
    }

    /// Create a queue with per-item exponential backoff between `base` and `max`
    pub fn with_backoff(name: impl Into<String>, base: Duration, max: Duration) -> Self {
        Self::new(name, ItemExponentialBackoff::new(base, max))
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Mark `key` as needing processing.
    pub fn add(&self, key: &str) {
        {
            let mut state = self.inner.state.lock();
            if state.shutting_down || state.dirty.contains(key) {
                return;
            }
            state.dirty.insert(key.to_string());
            if state.processing.contains(key) {
                return;
            }
            state.queue.push_back(key.to_string());
        }
        self.inner.notify.notify_one();
    }

    /// Wait for the next key. Returns `None` once the queue is shut down and
    /// nothing is left to hand out.
    ///
    /// The returned key must be released with [`done`](Self::done).
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before inspecting state so a shutdown in between
            // still wakes us.
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        // Pass the baton, a single notify may cover several adds
                        self.inner.notify.notify_one();
                    }
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Release a key handed out by [`get`](Self::get).
    pub fn done(&self, key: &str) {
        let requeued = {
            let mut state = self.inner.state.lock();
            state.processing.remove(key);
            if state.dirty.contains(key) {
                state.queue.push_back(key.to_string());
                true
            } else {
                false
            }
        };
        if requeued {
            self.inner.notify.notify_one();
        }
    }

    /// Add `key` after `delay` has elapsed.
    pub fn add_after(&self, key: &str, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(key);
            return;
        }

        trace!(queue = %self.inner.name, key, ?delay, "Delaying add");
        let queue = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Add `key` after the delay its rate limiter asks for.
    pub fn add_rate_limited(&self, key: &str) {
        let delay = self.inner.limiter.when(key);
        self.add_after(key, delay);
    }

    /// Stop tracking retries for `key`.
    pub fn forget(&self, key: &str) {
        self.inner.limiter.forget(key);
    }

    /// How many times `key` has been rate-limited since it was last forgotten.
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.inner.limiter.num_requeues(key)
    }

    /// Stop accepting keys and wake every waiting [`get`](Self::get).
    pub fn shut_down(&self) {
        self.inner.state.lock().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }

    /// Number of keys waiting to be handed out
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn queue() -> RateLimitingQueue {
        RateLimitingQueue::with_backoff("test", Duration::from_secs(1), Duration::from_secs(8))
    }

    #[tokio::test]
    async fn test_pending_keys_are_deduplicated() {
        let q = queue();
        q.add("ns:a");
        q.add("ns:a");
        q.add("ns:b");

        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await.as_deref(), Some("ns:a"));
        assert_eq!(q.get().await.as_deref(), Some("ns:b"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_key_added_while_processing_waits_for_done() {
        let q = queue();
        q.add("ns:a");
        let key = q.get().await.unwrap();

        q.add("ns:a");
        assert_eq!(q.len(), 0, "in-flight key must not be handed out twice");

        q.done(&key);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await.as_deref(), Some("ns:a"));
    }

    #[tokio::test]
    async fn test_done_without_readd_does_not_requeue() {
        let q = queue();
        q.add("ns:a");
        let key = q.get().await.unwrap();
        q.done(&key);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_wakes_blocked_getter() {
        let q = queue();
        let getter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;

        q.shut_down();
        let got = tokio::time::timeout(Duration::from_secs(5), getter)
            .await
            .expect("getter must wake up")
            .unwrap();
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn test_add_after_shutdown_is_ignored() {
        let q = queue();
        q.shut_down();
        q.add("ns:a");
        assert!(q.is_empty());
        assert_eq!(q.get().await, None);
    }

    #[tokio::test]
    async fn test_blocked_getter_receives_later_add() {
        let q = queue();
        let getter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;

        q.add("ns:late");
        let got = tokio::time::timeout(Duration::from_secs(5), getter)
            .await
            .expect("getter must wake up")
            .unwrap();
        assert_eq!(got.as_deref(), Some("ns:late"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_add_is_delayed() {
        let q = queue();
        q.add_rate_limited("ns:a");
        assert!(q.is_empty());

        tokio::time::sleep(Duration::from_millis(999)).await;
        assert!(q.is_empty());

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(q.len(), 1);
        assert_eq!(q.num_requeues("ns:a"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forget_resets_backoff() {
        let q = queue();
        q.add_rate_limited("ns:a");
        q.add_rate_limited("ns:a");
        assert_eq!(q.num_requeues("ns:a"), 2);

        q.forget("ns:a");
        assert_eq!(q.num_requeues("ns:a"), 0);
    }
}
