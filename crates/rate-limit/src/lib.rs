//! Per-subject rate limiting for the admission layer.
//!
//! The [`RateLimiter`] facade resolves an effective policy for every check
//! (quota override, then endpoint policy, then the global or anonymous
//! default), scales it with system load through the [`AdaptiveThrottler`],
//! and evaluates it against the subject's own state:
//!
//! - **Token bucket**: burst-tolerant limiting. Each subject key gets a
//!   bucket that refills lazily at `capacity / window_secs` tokens per second
//!   and holds at most `capacity + burst` tokens.
//!
//! - **Sliding window counter**: strict per-window caps, estimated from two
//!   adjacent fixed windows in O(1) memory.
//!
//! State lives in a [`DashMap`](dashmap::DashMap) that only guards insertion
//! and eviction; every subject has its own lock for the read/modify/write.

pub mod clock;
pub mod decision;
pub mod load;
pub mod policy;
pub mod quota;
pub mod sliding_window;
mod store;
pub mod subject;
pub mod throttle;
pub mod token_bucket;

use std::sync::Arc;
use std::time::Duration;

use admission_common::{
    AdmissionError, AdmissionResult, EndpointPolicy, RateLimit, RateLimitConfig,
};
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace};

pub use clock::{Clock, ManualClock, SystemClock};
pub use decision::{Denial, PolicySource, RateLimitDecision};
pub use load::{CpuProbe, LoadSampler, LoadSignal, LoadSnapshot, QueueDepth, SysinfoCpu};
pub use policy::{PolicyLookup, PolicyTable};
pub use quota::{QuotaOverride, QuotaStore};
pub use sliding_window::{SlidingWindowCounter, WindowOutcome};
pub use subject::Subject;
pub use throttle::AdaptiveThrottler;
pub use token_bucket::{BucketOutcome, TokenBucket};

use store::{SubjectState, SubjectStore};

/// Whether a user's quota comes from an override or the global default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaSource {
    Override,
    Default,
}

/// Answer to [`RateLimiter::get_quota`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaView {
    pub user_id: String,
    pub limit: RateLimit,
    pub expires_at: Option<DateTime<Utc>>,
    pub source: QuotaSource,
}

/// What one [`RateLimiter::cleanup`] pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub evicted_subjects: usize,
    pub expired_overrides: usize,
}

/// The admission rate limiter.
///
/// Cheap to clone (backed by `Arc`) and safe to share across tasks and
/// threads. [`check`](RateLimiter::check) never blocks beyond one subject's
/// lock and never fails: every outcome is a [`RateLimitDecision`].
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<RateLimiterInner>,
}

struct RateLimiterInner {
    policies: ArcSwap<PolicyTable>,
    quotas: QuotaStore,
    subjects: SubjectStore,
    throttler: Arc<AdaptiveThrottler>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig, throttler: Arc<AdaptiveThrottler>) -> AdmissionResult<Self> {
        Self::with_clock(config, throttler, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: &RateLimitConfig,
        throttler: Arc<AdaptiveThrottler>,
        clock: Arc<dyn Clock>,
    ) -> AdmissionResult<Self> {
        let table = PolicyTable::from_config(config)?;
        info!(
            endpoints = table.endpoint_count(),
            global_capacity = table.global().capacity,
            global_window_secs = table.global().window_secs,
            "creating rate limiter"
        );
        Ok(Self {
            inner: Arc::new(RateLimiterInner {
                policies: ArcSwap::from_pointee(table),
                quotas: QuotaStore::new(),
                subjects: SubjectStore::default(),
                throttler,
                clock,
            }),
        })
    }

    /// Charge `cost` units to `subject` on `endpoint`.
    ///
    /// Quota is only consumed when the decision is `allowed`. A cost of zero
    /// is charged as one.
    pub fn check(&self, subject: &Subject, endpoint: &str, cost: u64) -> RateLimitDecision {
        let inner = &self.inner;
        let cost = cost.max(1);
        let now = inner.clock.now();
        let wall = inner.clock.wall();

        let (policy, source) = self.resolve(subject, endpoint, wall);
        let limit = inner.throttler.scale_limit(&policy.limit);
        let key = subject.key(endpoint);

        let entry = inner.subjects.get_or_insert(&key, policy.algorithm, &limit, now);
        let mut slot = entry.lock();
        slot.state.ensure(policy.algorithm, &limit, now);
        slot.touch(&limit, now);

        let ceiling = limit.ceiling();
        let (allowed, remaining, retry_after_secs, resets_in_secs) = match &mut slot.state {
            SubjectState::Bucket(bucket) => {
                let outcome = bucket.try_consume_at(&limit, cost, now);
                (
                    outcome.allowed,
                    outcome.tokens_remaining.max(0.0).floor() as u64,
                    outcome.retry_after_secs,
                    bucket.secs_until_full(&limit, now),
                )
            }
            SubjectState::Window(window) => {
                let period = limit.window();
                let outcome = window.record_and_check_at(ceiling, period, cost, now);
                (
                    outcome.allowed,
                    outcome.remaining,
                    outcome.retry_after_secs,
                    outcome.resets_in_secs,
                )
            }
        };
        drop(slot);

        let denial = match (allowed, retry_after_secs.is_finite()) {
            (true, _) => None,
            (false, true) => Some(Denial::QuotaExceeded),
            (false, false) => Some(Denial::CostExceedsCapacity),
        };

        match denial {
            None => trace!(subject = %subject, endpoint, cost, remaining, "request allowed"),
            Some(Denial::QuotaExceeded) => debug!(
                subject = %subject,
                endpoint,
                cost,
                retry_after_secs,
                "rate limit exceeded"
            ),
            Some(Denial::CostExceedsCapacity) => debug!(
                subject = %subject,
                endpoint,
                cost,
                ceiling,
                "request cost exceeds policy capacity"
            ),
        }

        RateLimitDecision {
            allowed,
            remaining: remaining.min(ceiling),
            limit: ceiling,
            reset_at: reset_timestamp(wall, resets_in_secs),
            retry_after_secs,
            denial,
            source,
            window_secs: limit.window_secs,
        }
    }

    /// Effective (unscaled) policy for `subject` on `endpoint`.
    fn resolve(
        &self,
        subject: &Subject,
        endpoint: &str,
        wall: DateTime<Utc>,
    ) -> (EndpointPolicy, PolicySource) {
        let table = self.inner.policies.load();
        let lookup = table.lookup(endpoint);
        let endpoint_policy = *lookup.policy();

        if let Some(user_id) = subject.user_id() {
            if let Some(quota) = self.inner.quotas.get_active(user_id, wall) {
                let policy = EndpointPolicy {
                    limit: quota.limit,
                    algorithm: endpoint_policy.algorithm,
                };
                return (policy, PolicySource::Override);
            }
        }

        let default_source = match lookup {
            PolicyLookup::Found(_) => PolicySource::Endpoint,
            PolicyLookup::FallbackToDefault(_) => {
                debug!(endpoint, "no policy for endpoint, using global default");
                PolicySource::Global
            }
        };

        if subject.is_anonymous() {
            let anonymous = table.anonymous();
            // The anonymous default is a ceiling: a stricter endpoint still wins.
            if endpoint_policy.limit.refill_rate() < anonymous.refill_rate() {
                return (endpoint_policy, default_source);
            }
            let policy = EndpointPolicy {
                limit: anonymous,
                algorithm: endpoint_policy.algorithm,
            };
            return (policy, PolicySource::Anonymous);
        }

        (endpoint_policy, default_source)
    }

    /// The override in effect for `user_id`, or the global default.
    pub fn get_quota(&self, user_id: &str) -> QuotaView {
        let wall = self.inner.clock.wall();
        match self.inner.quotas.get_active(user_id, wall) {
            Some(quota) => QuotaView {
                user_id: quota.subject_id,
                limit: quota.limit,
                expires_at: quota.expires_at,
                source: QuotaSource::Override,
            },
            None => QuotaView {
                user_id: user_id.to_string(),
                limit: self.inner.policies.load().global(),
                expires_at: None,
                source: QuotaSource::Default,
            },
        }
    }

    /// Register a per-user override, replacing any previous one.
    pub fn set_quota(
        &self,
        user_id: &str,
        limit: RateLimit,
        expires_at: Option<DateTime<Utc>>,
    ) -> AdmissionResult<()> {
        let scope = format!("quota override for {}", user_id);
        if user_id.trim().is_empty() {
            return Err(AdmissionError::invalid_policy(scope, "user id must not be empty"));
        }
        limit.validate(&scope)?;
        if let Some(expiry) = expires_at {
            if expiry <= self.inner.clock.wall() {
                return Err(AdmissionError::invalid_policy(scope, "expires_at is in the past"));
            }
        }

        let replaced = self.inner.quotas.set(QuotaOverride {
            subject_id: user_id.to_string(),
            limit,
            expires_at,
        });
        info!(
            user_id,
            capacity = limit.capacity,
            window_secs = limit.window_secs,
            burst = limit.burst,
            expires_at = ?expires_at,
            replaced = replaced.is_some(),
            "quota override set"
        );
        Ok(())
    }

    /// Remove a user's override. Returns whether one existed.
    pub fn clear_quota(&self, user_id: &str) -> bool {
        let removed = self.inner.quotas.clear(user_id).is_some();
        if removed {
            info!(user_id, "quota override cleared");
        }
        removed
    }

    /// Swap in a new policy table.
    ///
    /// A table with any malformed entry is rejected as a whole and the
    /// previous one stays in effect.
    pub fn reload_policies(&self, config: &RateLimitConfig) -> AdmissionResult<()> {
        match PolicyTable::from_config(config) {
            Ok(table) => {
                info!(endpoints = table.endpoint_count(), "rate limit policies reloaded");
                self.inner.policies.store(Arc::new(table));
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "rejected rate limit policies, keeping previous table");
                Err(e)
            }
        }
    }

    pub fn policies(&self) -> Arc<PolicyTable> {
        self.inner.policies.load_full()
    }

    pub fn subjects_tracked(&self) -> usize {
        self.inner.subjects.len()
    }

    pub fn throttler(&self) -> &Arc<AdaptiveThrottler> {
        &self.inner.throttler
    }

    /// Evict idle subjects and purge expired overrides.
    pub fn cleanup(&self) -> CleanupReport {
        let now = self.inner.clock.now();
        let ttl = self.inner.policies.load().idle_ttl();
        let report = CleanupReport {
            evicted_subjects: self.inner.subjects.evict_idle(now, ttl),
            expired_overrides: self.inner.quotas.purge_expired(self.inner.clock.wall()),
        };
        debug!(
            evicted = report.evicted_subjects,
            expired_overrides = report.expired_overrides,
            remaining = self.inner.subjects.len(),
            "rate limiter cleanup completed"
        );
        report
    }

    /// Run [`cleanup`](Self::cleanup) every `interval` until `shutdown` flips.
    pub fn start_cleanup_task(
        &self,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let limiter = self.clone();
        let period = interval.max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = period.as_secs_f64(), "rate limiter cleanup task started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        limiter.cleanup();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("rate limiter cleanup task stopped");
        })
    }
}

/// Unix seconds, rounded up, `in_secs` after `wall`.
fn reset_timestamp(wall: DateTime<Utc>, in_secs: f64) -> i64 {
    let in_secs = if in_secs.is_finite() { in_secs.max(0.0) } else { 0.0 };
    let at = wall.timestamp_millis() as f64 / 1000.0 + in_secs;
    at.ceil() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use admission_common::{RateLimitAlgorithm, MAX_WINDOW_SECS};

    fn config() -> RateLimitConfig {
        let mut config = RateLimitConfig {
            global: RateLimit::new(10, 60.0, 0),
            anonymous: RateLimit::new(2, 60.0, 0),
            ..RateLimitConfig::default()
        };
        config.endpoints.insert(
            "search".to_string(),
            EndpointPolicy {
                limit: RateLimit::new(3, 1.0, 0),
                algorithm: RateLimitAlgorithm::SlidingWindow,
            },
        );
        config.endpoints.insert(
            "export".to_string(),
            EndpointPolicy {
                limit: RateLimit::new(1, 60.0, 0),
                algorithm: RateLimitAlgorithm::TokenBucket,
            },
        );
        config
    }

    fn limiter() -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let limiter = RateLimiter::with_clock(
            &config(),
            Arc::new(AdaptiveThrottler::disabled()),
            clock.clone(),
        )
        .unwrap();
        (limiter, clock)
    }

    #[test]
    fn unknown_endpoint_uses_global_policy() {
        let (limiter, _) = limiter();
        let decision = limiter.check(&Subject::user("alice"), "unlisted", 1);
        assert!(decision.allowed);
        assert_eq!(decision.source, PolicySource::Global);
        assert_eq!(decision.limit, 10);
        assert_eq!(decision.remaining, 9);
    }

    #[test]
    fn endpoint_policy_selects_algorithm() {
        let (limiter, _) = limiter();
        let user = Subject::user("alice");
        for _ in 0..3 {
            assert!(limiter.check(&user, "search", 1).allowed);
        }
        let denied = limiter.check(&user, "search", 1);
        assert!(!denied.allowed);
        assert_eq!(denied.source, PolicySource::Endpoint);
        assert_eq!(denied.denial, Some(Denial::QuotaExceeded));
    }

    #[test]
    fn subjects_and_endpoints_are_isolated() {
        let (limiter, _) = limiter();
        let alice = Subject::user("alice");
        assert!(limiter.check(&alice, "export", 1).allowed);
        assert!(!limiter.check(&alice, "export", 1).allowed);

        assert!(limiter.check(&Subject::user("bob"), "export", 1).allowed);
        assert!(limiter.check(&alice, "unlisted", 1).allowed);
        assert_eq!(limiter.subjects_tracked(), 3);
    }

    #[test]
    fn user_named_like_an_anonymous_key_gets_its_own_state() {
        let (limiter, _) = limiter();
        let ip = Subject::anonymous_ip("1.2.3.4".parse().unwrap());
        assert!(limiter.check(&Subject::user("anon:ip:1.2.3.4"), "export", 1).allowed);
        assert!(limiter.check(&ip, "export", 1).allowed);
        assert_eq!(limiter.subjects_tracked(), 2);
    }

    #[test]
    fn anonymous_subjects_get_the_stricter_default() {
        let (limiter, _) = limiter();
        let anon = Subject::anonymous_ip("203.0.113.9".parse().unwrap());

        let first = limiter.check(&anon, "unlisted", 1);
        assert_eq!(first.source, PolicySource::Anonymous);
        assert_eq!(first.limit, 2);
        assert!(limiter.check(&anon, "unlisted", 1).allowed);
        assert!(!limiter.check(&anon, "unlisted", 1).allowed);

        // 1/min on export is stricter than the anonymous 2/min.
        let export = limiter.check(&anon, "export", 1);
        assert_eq!(export.source, PolicySource::Endpoint);
        assert_eq!(export.limit, 1);
    }

    #[test]
    fn oversized_cost_is_a_permanent_denial() {
        let (limiter, _) = limiter();
        let decision = limiter.check(&Subject::user("alice"), "unlisted", 11);
        assert!(!decision.allowed);
        assert!(decision.is_permanent());
        assert_eq!(decision.retry_after_header(), Some(60));
        // Nothing was consumed.
        assert_eq!(limiter.check(&Subject::user("alice"), "unlisted", 10).remaining, 0);
    }

    #[test]
    fn zero_cost_is_charged_as_one() {
        let (limiter, _) = limiter();
        let decision = limiter.check(&Subject::user("alice"), "unlisted", 0);
        assert_eq!(decision.remaining, 9);
    }

    #[test]
    fn reset_at_points_at_full_refill() {
        let (limiter, clock) = limiter();
        let start = clock.wall().timestamp_millis() as f64 / 1000.0;
        let decision = limiter.check(&Subject::user("alice"), "unlisted", 1);
        // One token at 10/60s takes six seconds to come back.
        assert_eq!(decision.reset_at, (start + 6.0).ceil() as i64);
    }

    #[test]
    fn rejected_reload_keeps_previous_table() {
        let (limiter, _) = limiter();
        let mut broken = config();
        broken.endpoints.insert(
            "bad".to_string(),
            EndpointPolicy {
                limit: RateLimit::new(0, 1.0, 0),
                algorithm: RateLimitAlgorithm::TokenBucket,
            },
        );

        assert!(limiter.reload_policies(&broken).is_err());
        assert_eq!(limiter.policies().endpoint_count(), 2);

        let mut smaller = config();
        smaller.endpoints.remove("search");
        limiter.reload_policies(&smaller).unwrap();
        assert_eq!(limiter.policies().endpoint_count(), 1);
    }

    #[test]
    fn algorithm_change_on_reload_resets_subject_state() {
        let (limiter, _) = limiter();
        let user = Subject::user("alice");
        assert!(limiter.check(&user, "export", 1).allowed);
        assert!(!limiter.check(&user, "export", 1).allowed);

        let mut changed = config();
        changed.endpoints.insert(
            "export".to_string(),
            EndpointPolicy {
                limit: RateLimit::new(1, 60.0, 0),
                algorithm: RateLimitAlgorithm::SlidingWindow,
            },
        );
        limiter.reload_policies(&changed).unwrap();
        assert!(limiter.check(&user, "export", 1).allowed);
    }

    #[test]
    fn set_quota_rejects_bad_input() {
        let (limiter, clock) = limiter();
        assert!(limiter.set_quota("alice", RateLimit::new(0, 60.0, 0), None).is_err());
        assert!(limiter.set_quota("", RateLimit::new(5, 60.0, 0), None).is_err());

        let past = clock.wall() - chrono::Duration::seconds(1);
        assert!(limiter.set_quota("alice", RateLimit::new(5, 60.0, 0), Some(past)).is_err());
        assert_eq!(limiter.get_quota("alice").source, QuotaSource::Default);
    }

    #[test]
    fn window_beyond_a_year_is_rejected_and_a_year_is_served() {
        let (limiter, _) = limiter();
        assert!(limiter.set_quota("dana", RateLimit::new(10, 1e30, 0), None).is_err());
        assert_eq!(limiter.get_quota("dana").source, QuotaSource::Default);

        limiter
            .set_quota("dana", RateLimit::new(2, MAX_WINDOW_SECS, 0), None)
            .unwrap();
        let user = Subject::user("dana");
        for endpoint in ["search", "export"] {
            assert!(limiter.check(&user, endpoint, 1).allowed);
            assert!(limiter.check(&user, endpoint, 1).allowed);
            let denied = limiter.check(&user, endpoint, 1);
            assert!(!denied.allowed);
            assert!(denied.retry_after_secs.is_finite());
        }
    }

    #[test]
    fn clear_quota_falls_back_to_default() {
        let (limiter, _) = limiter();
        limiter.set_quota("alice", RateLimit::new(500, 60.0, 0), None).unwrap();
        assert_eq!(limiter.get_quota("alice").limit.capacity, 500);

        assert!(limiter.clear_quota("alice"));
        assert!(!limiter.clear_quota("alice"));
        let view = limiter.get_quota("alice");
        assert_eq!(view.source, QuotaSource::Default);
        assert_eq!(view.limit, RateLimit::new(10, 60.0, 0));
    }

    #[test]
    fn cleanup_evicts_idle_subjects_and_expired_overrides() {
        let (limiter, clock) = limiter();
        let expiry = clock.wall() + chrono::Duration::seconds(30);
        limiter.set_quota("alice", RateLimit::new(5, 60.0, 0), Some(expiry)).unwrap();
        limiter.check(&Subject::user("alice"), "unlisted", 1);
        limiter.check(&Subject::user("bob"), "search", 1);

        assert_eq!(limiter.cleanup(), CleanupReport::default());

        clock.advance(Duration::from_secs(3600));
        let report = limiter.cleanup();
        assert_eq!(report.evicted_subjects, 2);
        assert_eq!(report.expired_overrides, 1);
        assert_eq!(limiter.subjects_tracked(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_task_stops_on_shutdown() {
        let (limiter, _) = limiter();
        let (tx, rx) = watch::channel(false);
        let handle = limiter.start_cleanup_task(Duration::from_secs(60), rx);

        tokio::time::sleep(Duration::from_secs(125)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[test]
    fn clones_share_state() {
        let (limiter, _) = limiter();
        let other = limiter.clone();
        let user = Subject::user("carol");

        assert!(limiter.check(&user, "export", 1).allowed);
        assert!(!other.check(&user, "export", 1).allowed);
    }
}
