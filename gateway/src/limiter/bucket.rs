//! Token bucket arithmetic (spec.md §4.2), lifted verbatim from
//! `original_source/main.py`'s `check_rate_limit`: continuous refill
//! rather than fixed windows, capped at `capacity`, never going negative.

/// A single key's bucket. `tokens` and `last_refill` are the only
/// mutable state; `capacity`/`refill_rate` are fixed for the bucket's
/// lifetime (a changed limit gets a fresh bucket — see `Limiter::check`).
#[derive(Debug, Clone, Copy)]
pub struct Bucket {
    pub tokens: f64,
    pub capacity: f64,
    /// Tokens regenerated per second (`capacity / window_seconds`).
    pub refill_rate: f64,
    pub last_refill: f64,
}

impl Bucket {
    pub fn full(capacity: u32, window_seconds: u32) -> Self {
        let capacity = capacity as f64;
        Self {
            tokens: capacity,
            capacity,
            refill_rate: capacity / (window_seconds.max(1) as f64),
            last_refill: 0.0,
        }
    }

    /// Refills up to `now` (a monotonic seconds timestamp), then attempts
    /// to take one token. Returns `true` if the request is allowed.
    pub fn try_take(&mut self, now: f64) -> bool {
        let elapsed = (now - self.last_refill).max(0.0);
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn idle_for(&self, now: f64) -> f64 {
        (now - self.last_refill).max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_bucket_drains_then_refills_over_time() {
        // 10 requests / 60s window, mirroring spec.md §8 scenario 1.
        let mut bucket = Bucket::full(10, 60);

        for _ in 0..10 {
            assert!(bucket.try_take(0.0));
        }
        assert!(!bucket.try_take(0.0), "bucket should be empty after 10 takes");

        // After 20s at a refill rate of 10/60 tokens/sec, ~3.33 tokens
        // have regenerated — enough for exactly 3 more requests.
        assert!(bucket.try_take(20.0));
        assert!(bucket.try_take(20.0));
        assert!(bucket.try_take(20.0));
        assert!(!bucket.try_take(20.0));
    }

    #[test]
    fn never_exceeds_capacity() {
        let mut bucket = Bucket::full(5, 10);
        assert!(bucket.try_take(0.0));
        // A very long idle period refills past capacity; it must clamp.
        assert!(bucket.try_take(10_000.0));
        assert_eq!(bucket.tokens.floor(), 4.0);
    }
}
