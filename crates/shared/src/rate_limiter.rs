//! Short-window request rate limiter (part of component C6).
//!
//! Grounded on `state.rs`'s `RateLimiter::new_in_memory()` and
//! `routes/mcp_proxy.rs`'s `rate_limiter.check_api_key(...)` call shape in
//! the teacher: a token bucket keyed by `(org_id, api_key_id)`, independent
//! of the monthly quota accounting that lives in `plexmcp-quota`. Failing to
//! acquire the bucket lock or find a per-key entry fails *open* — a
//! malfunctioning rate limiter must never itself become an outage, matching
//! the teacher's documented fail-open posture for this exact check.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed { remaining: u32 },
    Rejected { retry_after_seconds: u64 },
}

struct Bucket {
    tokens: f64,
    capacity: f64,
    refill_per_second: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(capacity_per_minute: u32) -> Self {
        let capacity = capacity_per_minute as f64;
        Self {
            tokens: capacity,
            capacity,
            refill_per_second: capacity / 60.0,
            last_refill: Instant::now(),
        }
    }

    fn try_take(&mut self, now: Instant) -> RateLimitDecision {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_second).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            RateLimitDecision::Allowed {
                remaining: self.tokens as u32,
            }
        } else {
            let deficit = 1.0 - self.tokens;
            let wait_seconds = (deficit / self.refill_per_second).ceil() as u64;
            RateLimitDecision::Rejected {
                retry_after_seconds: wait_seconds.max(1),
            }
        }
    }
}

/// In-memory token-bucket rate limiter. A single `RateLimiter` is shared
/// across the process via `AppState`; bucket state does not survive a
/// restart, which is acceptable for a short rolling window.
pub struct RateLimiter {
    buckets: Mutex<HashMap<(Uuid, Uuid), Bucket>>,
}

impl RateLimiter {
    pub fn new_in_memory() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Check and consume one token for `(org_id, api_key_id)`, using
    /// `limit_per_minute` as that key's bucket capacity. On lock poisoning
    /// the check fails open (`Allowed`) rather than blocking every request
    /// behind a single panicked holder.
    pub fn check_api_key(
        &self,
        org_id: Uuid,
        api_key_id: Uuid,
        limit_per_minute: u32,
    ) -> RateLimitDecision {
        let mut guard = match self.buckets.lock() {
            Ok(g) => g,
            Err(_) => return RateLimitDecision::Allowed { remaining: 0 },
        };
        let bucket = guard
            .entry((org_id, api_key_id))
            .or_insert_with(|| Bucket::new(limit_per_minute));
        bucket.try_take(Instant::now())
    }

    /// Drop buckets that have not been touched in over an hour, bounding
    /// memory for keys that stop sending traffic.
    pub fn sweep_idle(&self) {
        let Ok(mut guard) = self.buckets.lock() else {
            return;
        };
        let cutoff = Instant::now() - Duration::from_secs(3600);
        guard.retain(|_, bucket| bucket.last_refill > cutoff);
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new_in_memory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_capacity_then_rejects() {
        let limiter = RateLimiter::new_in_memory();
        let org = Uuid::new_v4();
        let key = Uuid::new_v4();
        for _ in 0..5 {
            assert!(matches!(
                limiter.check_api_key(org, key, 5),
                RateLimitDecision::Allowed { .. }
            ));
        }
        assert!(matches!(
            limiter.check_api_key(org, key, 5),
            RateLimitDecision::Rejected { .. }
        ));
    }

    #[test]
    fn distinct_keys_have_independent_buckets() {
        let limiter = RateLimiter::new_in_memory();
        let org = Uuid::new_v4();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        for _ in 0..3 {
            limiter.check_api_key(org, a, 3);
        }
        assert!(matches!(
            limiter.check_api_key(org, a, 3),
            RateLimitDecision::Rejected { .. }
        ));
        assert!(matches!(
            limiter.check_api_key(org, b, 3),
            RateLimitDecision::Allowed { .. }
        ));
    }
}
