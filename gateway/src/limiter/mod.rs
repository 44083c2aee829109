//! Per-key rate limiting (spec.md §4.2).
//!
//! Bucket storage follows the same `dashmap` + short `parking_lot`
//! critical section idiom as `store::memory`: one entry per
//! `(secret, capacity, window)`, so that changing a key's limit starts a
//! fresh bucket rather than reinterpreting stale `tokens`/`last_refill`
//! state under the new rate.

mod bucket;

pub use bucket::Bucket;

use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::config::AppConfig;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BucketKey {
    secret: String,
    capacity: u32,
    window_seconds: u32,
}

pub struct Limiter {
    buckets: DashMap<BucketKey, Mutex<Bucket>>,
    epoch: Instant,
    default_requests: u32,
    default_window_seconds: u32,
    idle_eviction_factor: u32,
}

impl Limiter {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            epoch: Instant::now(),
            default_requests: config.default_rate_limit_requests,
            default_window_seconds: config.default_rate_limit_window_seconds,
            idle_eviction_factor: AppConfig::BUCKET_IDLE_EVICTION_FACTOR,
        }
    }

    fn now(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    /// Checks and consumes one token for `secret`, under the given
    /// override (or the default limit if `None`). Returns `true` if the
    /// request is allowed.
    pub fn check(&self, secret: &str, override_limit: Option<(u32, u32)>) -> bool {
        let (capacity, window_seconds) =
            override_limit.unwrap_or((self.default_requests, self.default_window_seconds));
        let key = BucketKey {
            secret: secret.to_string(),
            capacity,
            window_seconds,
        };
        let now = self.now();
        let entry = self
            .buckets
            .entry(key)
            .or_insert_with(|| Mutex::new(Bucket::full(capacity, window_seconds)));
        entry.value().lock().try_take(now)
    }

    /// Drops buckets untouched for at least `window * idle_eviction_factor`
    /// seconds, bounding memory for keys that stop sending traffic
    /// (spec.md §4.2 "a safe policy is to evict only buckets untouched for
    /// >= window * 2").
    pub fn evict_idle(&self) {
        let now = self.now();
        self.buckets.retain(|key, bucket| {
            let idle_limit = (key.window_seconds * self.idle_eviction_factor) as f64;
            bucket.lock().idle_for(now) < idle_limit
        });
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn test_config() -> AppConfig {
        AppConfig::parse_from(["gateway"])
    }

    #[test]
    fn distinct_secrets_get_independent_buckets() {
        let limiter = Limiter::new(&test_config());
        for _ in 0..10 {
            assert!(limiter.check("key-a", Some((10, 60))));
        }
        assert!(!limiter.check("key-a", Some((10, 60))));
        // key-b has its own bucket, unaffected by key-a's exhaustion.
        assert!(limiter.check("key-b", Some((10, 60))));
    }

    #[test]
    fn changing_the_limit_starts_a_fresh_bucket() {
        let limiter = Limiter::new(&test_config());
        for _ in 0..5 {
            assert!(limiter.check("key-a", Some((5, 60))));
        }
        assert!(!limiter.check("key-a", Some((5, 60))));
        // A different (capacity, window) is a different bucket key, so it
        // starts full rather than inheriting the exhausted state.
        assert!(limiter.check("key-a", Some((20, 60))));
        assert_eq!(limiter.len(), 2);
    }

    #[test]
    fn falls_back_to_default_limit_when_no_override() {
        let limiter = Limiter::new(&test_config());
        for _ in 0..limiter.default_requests {
            assert!(limiter.check("key-a", None));
        }
        assert!(!limiter.check("key-a", None));
    }
}
