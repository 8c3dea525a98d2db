//! Keyed work queue.
//!
//! - A key is held at most once while waiting, however often it is added
//! - A key is handed to at most one worker at a time; adds during processing
//!   are replayed once the worker calls [`WorkQueue::done`]
//! - Failed keys are retried with per-key exponential backoff until
//!   [`WorkQueue::forget`] resets them

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use extmod_reconcile::BackoffPolicy;
use tokio::sync::Notify;

struct State<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    failures: HashMap<K, u32>,
    shutting_down: bool,
}

struct Inner<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    backoff: BackoffPolicy,
}

/// A deduplicating, rate-limited work queue shared between workers.
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    failures: HashMap::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                backoff,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State<K>> {
        // A panic while holding the lock leaves the state consistent
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue a key now.
    pub fn add(&self, key: K) {
        let mut state = self.state();
        if state.shutting_down || !state.dirty.insert(key.clone()) {
            return;
        }
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Enqueue a key once `delay` has elapsed.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        if self.is_shutting_down() {
            return;
        }

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Enqueue a key after its next backoff delay.
    pub fn add_rate_limited(&self, key: K) {
        let delay = {
            let mut state = self.state();
            let attempts = state.failures.entry(key.clone()).or_insert(0);
            let delay = self.inner.backoff.delay(*attempts);
            *attempts = attempts.saturating_add(1);
            delay
        };
        self.add_after(key, delay);
    }

    /// Reset a key's backoff.
    pub fn forget(&self, key: &K) {
        self.state().failures.remove(key);
    }

    /// Number of backoff retries recorded for a key.
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.state().failures.get(key).copied().unwrap_or(0)
    }

    /// Wait for the next key. Returns `None` once the queue is shut down and drained.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Mark a key as processed.
    pub fn done(&self, key: &K) {
        let mut state = self.state();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Stop accepting keys and wake every waiting worker.
    pub fn shut_down(&self) {
        self.state().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }

    /// Number of keys waiting.
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> WorkQueue<String> {
        WorkQueue::new(BackoffPolicy::default())
    }

    #[tokio::test]
    async fn test_dedupes_waiting_keys() {
        let q = queue();
        q.add("a".to_string());
        q.add("a".to_string());
        q.add("b".to_string());

        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await.as_deref(), Some("a"));
        assert_eq!(q.get().await.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_add_during_processing_is_replayed_after_done() {
        let q = queue();
        q.add("a".to_string());

        let key = q.get().await.unwrap();
        q.add("a".to_string());
        // Not handed out while in flight
        assert!(q.is_empty());

        q.done(&key);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await.as_deref(), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_backoff_grows() {
        let q = queue();
        let key = "a".to_string();

        q.add_rate_limited(key.clone());
        q.add_rate_limited(key.clone());
        assert_eq!(q.num_requeues(&key), 2);
        assert!(q.is_empty());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(q.len(), 1);

        q.forget(&key);
        assert_eq!(q.num_requeues(&key), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_after() {
        let q = queue();
        q.add_after("a".to_string(), Duration::from_secs(15));

        tokio::time::sleep(Duration::from_secs(14)).await;
        assert!(q.is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(q.get().await.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_shutdown_wakes_workers() {
        let q = queue();
        let worker = tokio::spawn({
            let q = q.clone();
            async move { q.get().await }
        });

        tokio::task::yield_now().await;
        q.shut_down();

        assert_eq!(worker.await.unwrap(), None);
        q.add("late".to_string());
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_drains_remaining_keys() {
        let q = queue();
        q.add("a".to_string());
        q.shut_down();

        assert_eq!(q.get().await.as_deref(), Some("a"));
        assert_eq!(q.get().await, None);
    }
}
