//! Delayed, rate-limited work queue of object keys.
//!
//! A key sits in the queue at most once and is never handed to two workers
//! at the same time. A key added while a worker holds it is queued again
//! when that worker calls [`WorkQueue::done`].

use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

/// Backoff settings for rate-limited re-adds
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Delay after the first failure
    pub base_delay: Duration,
    /// Upper bound for the doubling delay
    pub max_delay: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
        }
    }
}

#[derive(Default)]
struct State {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    /// Earliest pending ready time per delayed key
    waiting: HashMap<String, Instant>,
    delayed: BinaryHeap<Reverse<(Instant, u64, String)>>,
    failures: HashMap<String, u32>,
    seq: u64,
    shutting_down: bool,
}

impl State {
    fn insert(&mut self, key: String) {
        if self.shutting_down || !self.dirty.insert(key.clone()) {
            return;
        }
        if !self.processing.contains(&key) {
            self.queue.push_back(key);
        }
    }

    /// Move delayed keys whose time has come into the queue
    fn promote_ready(&mut self, now: Instant) {
        while let Some(Reverse((at, _, _))) = self.delayed.peek() {
            if *at > now {
                break;
            }
            let Some(Reverse((at, _, key))) = self.delayed.pop() else {
                break;
            };
            // Superseded by an earlier add_after for the same key
            if self.waiting.get(&key) != Some(&at) {
                continue;
            }
            self.waiting.remove(&key);
            self.insert(key);
        }
    }

    fn next_ready(&self) -> Option<Instant> {
        self.delayed.peek().map(|Reverse((at, _, _))| *at)
    }
}

/// Work queue shared by the watch router and a reconciler's workers
pub struct WorkQueue {
    name: String,
    config: QueueConfig,
    state: Mutex<State>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new(name: impl Into<String>, config: QueueConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(State::default()),
            notify: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue `key` for processing now
    pub fn add(&self, key: impl Into<String>) {
        self.state.lock().insert(key.into());
        self.notify.notify_waiters();
    }

    /// Queue `key` once `delay` has passed
    pub fn add_after(&self, key: impl Into<String>, delay: Duration) {
        let key = key.into();
        if delay.is_zero() {
            self.add(key);
            return;
        }

        let at = Instant::now() + delay;
        {
            let mut state = self.state.lock();
            if state.shutting_down {
                return;
            }
            if state.waiting.get(&key).is_some_and(|existing| *existing <= at) {
                return;
            }
            state.waiting.insert(key.clone(), at);
            state.seq += 1;
            let seq = state.seq;
            state.delayed.push(Reverse((at, seq, key.clone())));
        }
        debug!("[{}] {} scheduled in {:?}", self.name, key, delay);
        self.notify.notify_waiters();
    }

    /// Queue `key` after its per-key exponential backoff
    pub fn add_rate_limited(&self, key: impl Into<String>) {
        let key = key.into();
        let failures = {
            let mut state = self.state.lock();
            let count = state.failures.entry(key.clone()).or_insert(0);
            *count += 1;
            *count
        };
        self.add_after(key, self.backoff(failures));
    }

    /// Reset the backoff of `key`
    pub fn forget(&self, key: &str) {
        self.state.lock().failures.remove(key);
    }

    /// Rate-limited re-adds of `key` since it was last forgotten
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.state.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Delay applied after `failures` consecutive failures
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(32);
        let delay = self
            .config
            .base_delay
            .checked_mul(1u32 << exponent.min(31))
            .unwrap_or(self.config.max_delay);
        delay.min(self.config.max_delay)
    }

    /// Wait for the next key. Returns `None` once the queue is shut down and
    /// drained.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before inspecting state so a concurrent add is not missed
            notified.as_mut().enable();

            let next_ready = {
                let mut state = self.state.lock();
                state.promote_ready(Instant::now());
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
                state.next_ready()
            };

            match next_ready {
                Some(at) => {
                    tokio::select! {
                        _ = notified.as_mut() => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Mark `key` as finished; a re-add that arrived meanwhile is queued now
    pub fn done(&self, key: &str) {
        let requeued = {
            let mut state = self.state.lock();
            state.processing.remove(key);
            if state.dirty.contains(key) {
                state.queue.push_back(key.to_string());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_waiters();
        }
    }

    /// Keys ready for processing
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting keys and wake every waiting worker
    pub fn shut_down(&self) {
        {
            let mut state = self.state.lock();
            state.shutting_down = true;
            state.delayed.clear();
            state.waiting.clear();
        }
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn make_queue() -> WorkQueue {
        WorkQueue::new("test", QueueConfig::default())
    }

    #[tokio::test]
    async fn test_dedup_and_requeue_while_processing() {
        let queue = make_queue();
        queue.add("a");
        queue.add("a");
        queue.add("b");
        assert_eq!(queue.len(), 2);

        let key = queue.get().await.unwrap();
        assert_eq!(key, "a");

        // Re-added while held: not handed out again until done
        queue.add("a");
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await.unwrap(), "b");
        assert!(queue.is_empty());

        queue.done("a");
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await.unwrap(), "a");
        queue.done("a");
        queue.done("b");
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_after_waits_for_delay() {
        let queue = make_queue();
        let start = Instant::now();
        queue.add_after("slice", Duration::from_secs(30));
        queue.add_after("slice", Duration::from_secs(60));
        assert!(queue.is_empty());

        assert_eq!(queue.get().await.unwrap(), "slice");
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(30));
        assert!(waited < Duration::from_secs(60));
        queue.done("slice");
    }

    #[tokio::test(start_paused = true)]
    async fn test_earlier_add_wakes_waiting_worker() {
        let queue = Arc::new(make_queue());
        queue.add_after("late", Duration::from_secs(600));

        let worker = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;
        queue.add("now");

        assert_eq!(worker.await.unwrap().as_deref(), Some("now"));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let queue = make_queue();
        assert_eq!(queue.backoff(1), Duration::from_millis(5));
        assert_eq!(queue.backoff(2), Duration::from_millis(10));
        assert_eq!(queue.backoff(4), Duration::from_millis(40));
        assert_eq!(queue.backoff(40), Duration::from_secs(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_requeues_until_forgotten() {
        let queue = make_queue();
        queue.add_rate_limited("claim");
        queue.add_rate_limited("claim");
        assert_eq!(queue.num_requeues("claim"), 2);

        assert_eq!(queue.get().await.unwrap(), "claim");
        queue.forget("claim");
        queue.done("claim");
        assert_eq!(queue.num_requeues("claim"), 0);
    }

    #[tokio::test]
    async fn test_shutdown_releases_workers() {
        let queue = Arc::new(make_queue());
        let worker = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;

        queue.shut_down();
        assert_eq!(worker.await.unwrap(), None);

        queue.add("ignored");
        assert!(queue.is_empty());
        assert_eq!(queue.get().await, None);
    }
}
