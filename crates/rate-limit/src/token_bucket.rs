use std::time::Instant;

use admission_common::RateLimit;

/// Result of a single [`TokenBucket::try_consume_at`] call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketOutcome {
    pub allowed: bool,
    pub tokens_remaining: f64,
    /// `0.0` when allowed, `f64::INFINITY` when the request can never fit.
    pub retry_after_secs: f64,
}

/// Token bucket state for one subject key.
///
/// The bucket does not store its policy: the effective limit is handed in on
/// every call, so the adaptive throttler can shrink or widen it without ever
/// rewriting the subject's state. Refill is computed lazily from the time
/// elapsed since `last_refill`; there is no timer.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A new bucket starts full (`capacity + burst` tokens).
    pub fn new(limit: &RateLimit, now: Instant) -> Self {
        Self {
            tokens: limit.ceiling() as f64,
            last_refill: now,
        }
    }

    /// Tokens that would be available at `now`, without consuming anything.
    pub fn available_at(&self, limit: &RateLimit, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        (self.tokens + elapsed * limit.refill_rate()).min(limit.ceiling() as f64)
    }

    /// Try to take `n` tokens.
    ///
    /// State is only written when the request is allowed: a denied call leaves
    /// both `tokens` and `last_refill` untouched, and because refill is a pure
    /// function of elapsed time the next call sees exactly the same quota it
    /// would have seen without the denial.
    pub fn try_consume_at(&mut self, limit: &RateLimit, n: u64, now: Instant) -> BucketOutcome {
        self.check_invariants(now);

        let available = self.available_at(limit, now);
        let cost = n as f64;

        if n > limit.ceiling() {
            return BucketOutcome {
                allowed: false,
                tokens_remaining: available,
                retry_after_secs: f64::INFINITY,
            };
        }

        if available >= cost {
            self.tokens = available - cost;
            self.last_refill = now;
            BucketOutcome {
                allowed: true,
                tokens_remaining: self.tokens,
                retry_after_secs: 0.0,
            }
        } else {
            BucketOutcome {
                allowed: false,
                tokens_remaining: available,
                retry_after_secs: (cost - available) / limit.refill_rate(),
            }
        }
    }

    /// Seconds until the bucket would be full again.
    pub fn secs_until_full(&self, limit: &RateLimit, now: Instant) -> f64 {
        let missing = limit.ceiling() as f64 - self.available_at(limit, now);
        (missing / limit.refill_rate()).max(0.0)
    }

    fn check_invariants(&mut self, now: Instant) {
        if self.tokens.is_finite() && self.tokens >= 0.0 {
            return;
        }
        if cfg!(debug_assertions) {
            panic!("token bucket invariant violated: tokens = {}", self.tokens);
        }
        tracing::error!(
            tokens = self.tokens,
            "token bucket invariant violated, resetting bucket to empty"
        );
        self.tokens = 0.0;
        self.last_refill = now;
    }
}
