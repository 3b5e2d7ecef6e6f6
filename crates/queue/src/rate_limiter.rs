//! Backoff policies used by [`crate::ChangeQueue::add_rate_limited`].

use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::Instant;

/// Decides how long a failed key waits before it is queued again.
pub trait RateLimiter<K>: Send + Sync {
    /// Delay for the next retry of `key`; records one more failure.
    fn when(&self, key: &K) -> Duration;
    /// Drop all retry state for `key`.
    fn forget(&self, key: &K);
    /// Failures recorded for `key` since the last `forget`.
    fn num_requeues(&self, key: &K) -> u32;
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-key exponential backoff: `base * 2^failures`, capped at `max`.
pub struct ExponentialFailureRateLimiter<K> {
    base: Duration,
    max: Duration,
    failures: Mutex<FxHashMap<K, u32>>,
}

impl<K> ExponentialFailureRateLimiter<K> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, failures: Mutex::new(FxHashMap::default()) }
    }
}

impl<K: Clone + Eq + Hash + Send> RateLimiter<K> for ExponentialFailureRateLimiter<K> {
    fn when(&self, key: &K) -> Duration {
        let mut failures = lock(&self.failures);
        let slot = failures.entry(key.clone()).or_insert(0);
        let exp = *slot;
        *slot = slot.saturating_add(1);

        let backoff = 1u128
            .checked_shl(exp)
            .filter(|_| exp < 64)
            .and_then(|factor| self.base.as_nanos().checked_mul(factor));
        match backoff {
            Some(nanos) if nanos <= self.max.as_nanos() => Duration::from_nanos(nanos as u64),
            _ => self.max,
        }
    }

    fn forget(&self, key: &K) {
        lock(&self.failures).remove(key);
    }

    fn num_requeues(&self, key: &K) -> u32 {
        lock(&self.failures).get(key).copied().unwrap_or(0)
    }
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Slowest refill rate accepted; lower or invalid rates are raised to it.
const MIN_QPS: f64 = 0.001;
/// Longest wait the bucket hands out, however deep its debt.
const MAX_BUCKET_WAIT: Duration = Duration::from_secs(1000);

/// Overall token bucket shared by all keys (`qps` refill, `burst` capacity).
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl BucketRateLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            qps: qps.max(MIN_QPS),
            burst,
            bucket: Mutex::new(Bucket { tokens: burst, last: Instant::now() }),
        }
    }
}

impl<K> RateLimiter<K> for BucketRateLimiter {
    fn when(&self, _key: &K) -> Duration {
        let mut b = lock(&self.bucket);
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(b.last).as_secs_f64();
        b.tokens = (b.tokens + elapsed * self.qps).min(self.burst);
        b.last = now;
        // Reserve a token even when the bucket is empty; debt is paid by waiting.
        b.tokens -= 1.0;
        if b.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64(-b.tokens / self.qps)
                .map_or(MAX_BUCKET_WAIT, |d| d.min(MAX_BUCKET_WAIT))
        }
    }

    fn forget(&self, _key: &K) {}

    fn num_requeues(&self, _key: &K) -> u32 { 0 }
}

/// Combines limiters by taking the longest delay.
pub struct MaxOfRateLimiter<K> {
    limiters: Vec<Box<dyn RateLimiter<K>>>,
}

impl<K> MaxOfRateLimiter<K> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<K>>>) -> Self { Self { limiters } }
}

impl<K> RateLimiter<K> for MaxOfRateLimiter<K> {
    fn when(&self, key: &K) -> Duration {
        self.limiters.iter().map(|l| l.when(key)).max().unwrap_or(Duration::ZERO)
    }

    fn forget(&self, key: &K) {
        for l in &self.limiters {
            l.forget(key);
        }
    }

    fn num_requeues(&self, key: &K) -> u32 {
        self.limiters.iter().map(|l| l.num_requeues(key)).max().unwrap_or(0)
    }
}

/// Exponential 5ms..1000s per key, bounded overall by 10 qps with a burst of 100.
pub fn default_controller_rate_limiter<K>() -> MaxOfRateLimiter<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    MaxOfRateLimiter::new(vec![
        Box::new(ExponentialFailureRateLimiter::new(Duration::from_millis(5), Duration::from_secs(1000))),
        Box::new(BucketRateLimiter::new(10.0, 100)),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_doubles_until_capped() {
        let rl = ExponentialFailureRateLimiter::new(Duration::from_millis(1), Duration::from_millis(10));
        let delays: Vec<_> = (0..6).map(|_| rl.when(&"k")).collect();
        assert_eq!(
            delays,
            vec![1, 2, 4, 8, 10, 10].into_iter().map(Duration::from_millis).collect::<Vec<_>>()
        );
        assert_eq!(rl.num_requeues(&"k"), 6);
    }

    #[test]
    fn exponential_is_non_decreasing_and_forget_resets() {
        let rl = ExponentialFailureRateLimiter::new(Duration::from_millis(5), Duration::from_secs(1000));
        let mut prev = Duration::ZERO;
        for _ in 0..200 {
            let d = rl.when(&"k");
            assert!(d >= prev, "{d:?} < {prev:?}");
            prev = d;
        }
        assert_eq!(prev, Duration::from_secs(1000));
        rl.forget(&"k");
        assert_eq!(rl.num_requeues(&"k"), 0);
        assert_eq!(rl.when(&"k"), Duration::from_millis(5));
    }

    #[test]
    fn exponential_tracks_keys_independently() {
        let rl = ExponentialFailureRateLimiter::new(Duration::from_millis(1), Duration::from_secs(1));
        rl.when(&"a");
        rl.when(&"a");
        assert_eq!(rl.when(&"b"), Duration::from_millis(1));
        assert_eq!(rl.num_requeues(&"a"), 2);
    }

    #[test]
    fn bucket_allows_burst_then_delays() {
        let rl = BucketRateLimiter::new(1.0, 2);
        assert_eq!(RateLimiter::<&str>::when(&rl, &"a"), Duration::ZERO);
        assert_eq!(RateLimiter::<&str>::when(&rl, &"b"), Duration::ZERO);
        let third = RateLimiter::<&str>::when(&rl, &"c");
        assert!(third > Duration::from_millis(900) && third <= Duration::from_secs(1), "{third:?}");
    }

    #[test]
    fn bucket_with_degenerate_rate_waits_bounded() {
        for qps in [0.0, -5.0, f64::NAN, f64::MIN_POSITIVE] {
            let rl = BucketRateLimiter::new(qps, 1);
            assert_eq!(RateLimiter::<&str>::when(&rl, &"a"), Duration::ZERO);
            for _ in 0..3 {
                let d = RateLimiter::<&str>::when(&rl, &"a");
                assert!(d > Duration::ZERO && d <= MAX_BUCKET_WAIT, "qps {qps}: {d:?}");
            }
        }
    }

    #[test]
    fn max_of_takes_longest_and_forgets_everywhere() {
        let rl: MaxOfRateLimiter<&str> = MaxOfRateLimiter::new(vec![
            Box::new(ExponentialFailureRateLimiter::new(Duration::from_millis(1), Duration::from_secs(1))),
            Box::new(ExponentialFailureRateLimiter::new(Duration::from_millis(3), Duration::from_secs(1))),
        ]);
        assert_eq!(rl.when(&"k"), Duration::from_millis(3));
        assert_eq!(rl.when(&"k"), Duration::from_millis(6));
        assert_eq!(rl.num_requeues(&"k"), 2);
        rl.forget(&"k");
        assert_eq!(rl.num_requeues(&"k"), 0);
    }

    #[test]
    fn default_limiter_starts_small() {
        let rl = default_controller_rate_limiter::<String>();
        assert_eq!(rl.when(&"ns/a".to_string()), Duration::from_millis(5));
        assert_eq!(rl.when(&"ns/a".to_string()), Duration::from_millis(10));
    }
}
