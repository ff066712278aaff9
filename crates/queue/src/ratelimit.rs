use std::hash::Hash;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use rustc_hash::FxHashMap;

/// Per-key exponential backoff: `base * 2^failures`, capped at `max`.
///
/// Defaults match the usual controller limiter (5ms base, 1000s cap).
pub struct ExponentialBackoff<K> {
    base: Duration,
    max: Duration,
    failures: Mutex<FxHashMap<K, u32>>,
}

impl<K: Hash + Eq + Clone> ExponentialBackoff<K> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max: max.max(base), failures: Mutex::new(FxHashMap::default()) }
    }

    /// Delay before the next retry of `key`; records one more failure.
    pub fn when(&self, key: &K) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let n = failures.entry(key.clone()).or_insert(0);
        let exp = *n;
        *n = n.saturating_add(1);
        self.delay_for(exp)
    }

    pub fn num_requeues(&self, key: &K) -> u32 {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner).get(key).copied().unwrap_or(0)
    }

    /// Stop tracking `key`; its next failure starts again from `base`.
    pub fn forget(&self, key: &K) {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner).remove(key);
    }

    pub fn tracked(&self) -> usize { self.failures.lock().unwrap_or_else(PoisonError::into_inner).len() }

    fn delay_for(&self, exp: u32) -> Duration {
        let nanos = self.base.as_nanos().saturating_mul(1u128 << exp.min(64));
        let capped = nanos.min(self.max.as_nanos());
        Duration::from_nanos(u64::try_from(capped).unwrap_or(u64::MAX))
    }
}

impl<K: Hash + Eq + Clone> Default for ExponentialBackoff<K> {
    fn default() -> Self { Self::new(Duration::from_millis(5), Duration::from_secs(1000)) }
}
