use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use admission_common::{RateLimit, RateLimitAlgorithm};
use dashmap::DashMap;

use crate::sliding_window::SlidingWindowCounter;
use crate::token_bucket::TokenBucket;

/// Per-subject limiter state.
#[derive(Debug)]
pub(crate) enum SubjectState {
    Bucket(TokenBucket),
    Window(SlidingWindowCounter),
}

impl SubjectState {
    fn fresh(algorithm: RateLimitAlgorithm, limit: &RateLimit, now: Instant) -> Self {
        match algorithm {
            RateLimitAlgorithm::TokenBucket => Self::Bucket(TokenBucket::new(limit, now)),
            RateLimitAlgorithm::SlidingWindow => Self::Window(SlidingWindowCounter::new(now)),
        }
    }

    fn algorithm(&self) -> RateLimitAlgorithm {
        match self {
            Self::Bucket(_) => RateLimitAlgorithm::TokenBucket,
            Self::Window(_) => RateLimitAlgorithm::SlidingWindow,
        }
    }

    /// Swap in fresh state when an endpoint's algorithm was changed by a reload.
    pub(crate) fn ensure(&mut self, algorithm: RateLimitAlgorithm, limit: &RateLimit, now: Instant) {
        if self.algorithm() != algorithm {
            tracing::debug!(?algorithm, "subject algorithm changed, resetting state");
            *self = Self::fresh(algorithm, limit, now);
        }
    }
}

/// What the entry lock protects.
#[derive(Debug)]
pub(crate) struct Slot {
    pub(crate) state: SubjectState,
    /// Last check against this subject, allowed or denied.
    pub(crate) last_seen: Instant,
    /// Window of the policy last applied, so eviction never forgets a
    /// subject while its quota is still recovering.
    pub(crate) window: Duration,
}

impl Slot {
    pub(crate) fn touch(&mut self, limit: &RateLimit, now: Instant) {
        self.last_seen = now;
        self.window = limit.window();
    }

    fn is_idle(&self, now: Instant, ttl: Duration) -> bool {
        let keep_for = ttl.max(self.window.saturating_mul(2));
        now.saturating_duration_since(self.last_seen) >= keep_for
    }
}

/// One subject key's state behind its own lock.
#[derive(Debug)]
pub(crate) struct SubjectEntry {
    slot: Mutex<Slot>,
}

impl SubjectEntry {
    fn new(algorithm: RateLimitAlgorithm, limit: &RateLimit, now: Instant) -> Self {
        Self {
            slot: Mutex::new(Slot {
                state: SubjectState::fresh(algorithm, limit, now),
                last_seen: now,
                window: limit.window(),
            }),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Map from subject key to state.
///
/// The map itself only guards insertion and eviction: callers clone the
/// entry's `Arc` out of the shard and then lock the entry, so checks on
/// unrelated subjects never wait on each other.
#[derive(Debug, Default)]
pub(crate) struct SubjectStore {
    entries: DashMap<String, Arc<SubjectEntry>>,
}

impl SubjectStore {
    pub(crate) fn get_or_insert(
        &self,
        key: &str,
        algorithm: RateLimitAlgorithm,
        limit: &RateLimit,
        now: Instant,
    ) -> Arc<SubjectEntry> {
        if let Some(entry) = self.entries.get(key) {
            return Arc::clone(entry.value());
        }
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(SubjectEntry::new(algorithm, limit, now)));
        Arc::clone(entry.value())
    }

    /// Remove entries idle for longer than `ttl` (or two policy windows,
    /// whichever is longer).
    ///
    /// An entry whose `Arc` is held elsewhere has a check in flight and is
    /// kept; with the shard write-locked, nobody can take a new reference
    /// while we decide.
    pub(crate) fn evict_idle(&self, now: Instant, ttl: Duration) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_key, entry| {
            if Arc::strong_count(entry) > 1 {
                return true;
            }
            match entry.slot.try_lock() {
                Ok(slot) => !slot.is_idle(now, ttl),
                Err(_) => true,
            }
        });
        before.saturating_sub(self.entries.len())
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }
}
