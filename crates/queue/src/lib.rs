//! kube-event-alert change queue.
//!
//! A deduplicating work queue of object keys. A key handed out by [`ChangeQueue::get`]
//! is never handed out again until [`ChangeQueue::done`] is called for it; adds that
//! arrive meanwhile mark it dirty and it is queued again on `done`. Failed keys are
//! re-added after a backoff chosen by a [`RateLimiter`].

#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

pub mod rate_limiter;

pub use rate_limiter::{
    default_controller_rate_limiter, BucketRateLimiter, ExponentialFailureRateLimiter,
    MaxOfRateLimiter, RateLimiter,
};

/// Key waiting for its retry deadline.
struct Scheduled<K> {
    ready_at: Instant,
    seq: u64,
    key: K,
}

impl<K> PartialEq for Scheduled<K> {
    fn eq(&self, other: &Self) -> bool { self.ready_at == other.ready_at && self.seq == other.seq }
}

impl<K> Eq for Scheduled<K> {}

impl<K> PartialOrd for Scheduled<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}

// Reversed so the BinaryHeap pops the earliest deadline first.
impl<K> Ord for Scheduled<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        other.ready_at.cmp(&self.ready_at).then_with(|| other.seq.cmp(&self.seq))
    }
}

struct State<K> {
    /// Pending keys in FIFO order with the time they were queued.
    queue: VecDeque<(K, Instant)>,
    /// Keys that need processing: pending, or re-added while processing.
    dirty: FxHashSet<K>,
    /// Keys currently handed out to a worker.
    processing: FxHashSet<K>,
    /// Earliest retry deadline per scheduled key.
    scheduled: FxHashMap<K, Instant>,
    timers: BinaryHeap<Scheduled<K>>,
    seq: u64,
    shutting_down: bool,
}

impl<K: Clone + Eq + Hash> State<K> {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: FxHashSet::default(),
            processing: FxHashSet::default(),
            scheduled: FxHashMap::default(),
            timers: BinaryHeap::new(),
            seq: 0,
            shutting_down: false,
        }
    }

    /// Returns true when the key was pushed to the FIFO.
    fn insert(&mut self, key: K, now: Instant) -> bool {
        if !self.dirty.insert(key.clone()) {
            return false;
        }
        if self.processing.contains(&key) {
            return false;
        }
        self.queue.push_back((key, now));
        true
    }

    /// Move every key whose deadline passed into the FIFO.
    fn promote_due(&mut self, now: Instant) -> usize {
        let mut promoted = 0;
        while let Some(top) = self.timers.peek() {
            if top.ready_at > now {
                break;
            }
            let Some(Scheduled { ready_at, key, .. }) = self.timers.pop() else { break };
            // Stale heap entry: an earlier deadline replaced it and already fired.
            if self.scheduled.get(&key) != Some(&ready_at) {
                continue;
            }
            self.scheduled.remove(&key);
            if self.insert(key, now) {
                promoted += 1;
            }
        }
        promoted
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.timers.peek().map(|s| s.ready_at)
    }
}

/// Rate-limited, deduplicating queue of keys shared by the mirror callbacks and workers.
pub struct ChangeQueue<K> {
    name: String,
    state: Mutex<State<K>>,
    notify: Notify,
    limiter: Box<dyn RateLimiter<K>>,
}

impl<K> ChangeQueue<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    pub fn new(name: impl Into<String>, limiter: impl RateLimiter<K> + 'static) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(State::new()),
            notify: Notify::new(),
            limiter: Box::new(limiter),
        }
    }

    /// Queue backed by [`default_controller_rate_limiter`].
    pub fn with_default_rate_limiter(name: impl Into<String>) -> Self {
        Self::new(name, default_controller_rate_limiter())
    }

    pub fn name(&self) -> &str { &self.name }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_depth(&self, depth: usize) {
        metrics::gauge!("workqueue_depth", depth as f64, "name" => self.name.clone());
    }

    /// Mark `key` as needing processing. Duplicate adds coalesce; an add while the
    /// key is being processed is replayed once `done` is called. Ignored after shutdown.
    pub fn add(&self, key: K) {
        let mut st = self.lock();
        if st.shutting_down {
            return;
        }
        if st.insert(key, Instant::now()) {
            metrics::counter!("workqueue_adds_total", 1u64, "name" => self.name.clone());
            self.record_depth(st.queue.len());
            drop(st);
            self.notify.notify_one();
        }
    }

    /// Add `key` once `delay` has elapsed. If the key is already waiting the earlier
    /// deadline wins. Ignored after shutdown.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            return self.add(key);
        }
        let mut st = self.lock();
        if st.shutting_down {
            return;
        }
        let ready_at = Instant::now() + delay;
        if matches!(st.scheduled.get(&key), Some(at) if *at <= ready_at) {
            return;
        }
        st.seq += 1;
        let seq = st.seq;
        st.scheduled.insert(key.clone(), ready_at);
        st.timers.push(Scheduled { ready_at, seq, key });
        drop(st);
        // Let a waiting worker pick up the new deadline.
        self.notify.notify_one();
    }

    /// Re-add a failed key after the limiter's backoff for it.
    pub fn add_rate_limited(&self, key: K) {
        if self.is_shutting_down() {
            debug!(queue = %self.name, "queue shutting down; retry dropped");
            return;
        }
        let delay = self.limiter.when(&key);
        metrics::counter!("workqueue_retries_total", 1u64, "name" => self.name.clone());
        debug!(queue = %self.name, delay_ms = %delay.as_millis(), "requeue scheduled");
        self.add_after(key, delay);
    }

    /// Clear retry bookkeeping for `key` after it was handled successfully.
    pub fn forget(&self, key: &K) {
        self.limiter.forget(key);
    }

    pub fn num_requeues(&self, key: &K) -> u32 {
        self.limiter.num_requeues(key)
    }

    /// Wait for the next key. Returns `None` once the queue is shut down and drained;
    /// after shutdown this never waits.
    pub async fn get(&self) -> Option<K> {
        loop {
            // Registered before inspecting state so a concurrent add or shutdown is not missed.
            let notified = self.notify.notified();
            let deadline = {
                let mut st = self.lock();
                let now = Instant::now();
                st.promote_due(now);
                if let Some((key, queued_at)) = st.queue.pop_front() {
                    st.processing.insert(key.clone());
                    st.dirty.remove(&key);
                    let more = !st.queue.is_empty();
                    metrics::histogram!(
                        "workqueue_queue_duration_seconds",
                        now.saturating_duration_since(queued_at).as_secs_f64(),
                        "name" => self.name.clone()
                    );
                    self.record_depth(st.queue.len());
                    drop(st);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                if st.shutting_down {
                    return None;
                }
                st.next_deadline()
            };
            match deadline {
                Some(at) => {
                    let _ = tokio::time::timeout_at(at, notified).await;
                }
                None => notified.await,
            }
        }
    }

    /// Finish processing `key`. Must be called exactly once per key returned by `get`.
    pub fn done(&self, key: &K) {
        let mut st = self.lock();
        st.processing.remove(key);
        if st.dirty.contains(key) {
            st.queue.push_back((key.clone(), Instant::now()));
            self.record_depth(st.queue.len());
            drop(st);
            self.notify.notify_one();
        }
    }

    /// Stop accepting keys and wake all waiters. Keys already pending are still
    /// handed out; retries that are not yet due are dropped.
    pub fn shut_down(&self) {
        let mut st = self.lock();
        if st.shutting_down {
            return;
        }
        st.shutting_down = true;
        let dropped = st.scheduled.len();
        st.scheduled.clear();
        st.timers.clear();
        let pending = st.queue.len();
        drop(st);
        info!(queue = %self.name, pending, dropped_retries = dropped, "queue shutting down");
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool { self.lock().shutting_down }

    /// Number of pending keys (excludes keys being processed or waiting for retry).
    pub fn len(&self) -> usize { self.lock().queue.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Number of keys currently waiting for a retry deadline.
    pub fn scheduled_len(&self) -> usize { self.lock().scheduled.len() }
}
