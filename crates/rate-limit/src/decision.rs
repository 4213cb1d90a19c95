use http::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use http::StatusCode;
use serde::Serialize;

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Why a check was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Denial {
    /// Transient: quota will refill.
    QuotaExceeded,
    /// Permanent: the request cost is larger than the policy could ever grant.
    CostExceedsCapacity,
}

/// Where the effective policy for a check came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicySource {
    Override,
    Endpoint,
    Anonymous,
    Global,
}

/// Outcome of [`RateLimiter::check`](crate::RateLimiter::check).
///
/// Always fully populated, allowed or not, so callers can emit the standard
/// rate-limit headers on every response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u64,
    pub limit: u64,
    /// Unix timestamp (seconds) at which the subject's quota is fully restored.
    pub reset_at: i64,
    /// `0.0` when allowed, `f64::INFINITY` for permanent denials.
    pub retry_after_secs: f64,
    pub denial: Option<Denial>,
    pub source: PolicySource,
    pub window_secs: f64,
}

impl RateLimitDecision {
    pub fn is_permanent(&self) -> bool {
        self.denial == Some(Denial::CostExceedsCapacity)
    }

    pub fn status(&self) -> StatusCode {
        if self.allowed {
            StatusCode::OK
        } else {
            StatusCode::TOO_MANY_REQUESTS
        }
    }

    /// Whole seconds for the `Retry-After` header, `None` when allowed.
    ///
    /// Rounded up and never below one second. A permanent denial has no
    /// meaningful retry time, so it reports the policy window instead.
    pub fn retry_after_header(&self) -> Option<u64> {
        if self.allowed {
            return None;
        }
        let secs = if self.retry_after_secs.is_finite() {
            self.retry_after_secs
        } else {
            self.window_secs
        };
        // Absorb float noise so 6.000000000000001 still reads as 6.
        Some(((secs - 1e-9).ceil() as u64).max(1))
    }

    /// The `X-RateLimit-*` headers plus `Retry-After` on denial.
    pub fn headers(&self) -> Vec<(HeaderName, HeaderValue)> {
        let mut headers = vec![
            (X_RATELIMIT_LIMIT, HeaderValue::from(self.limit)),
            (X_RATELIMIT_REMAINING, HeaderValue::from(self.remaining)),
            (X_RATELIMIT_RESET, HeaderValue::from(self.reset_at)),
        ];
        if let Some(retry) = self.retry_after_header() {
            headers.push((RETRY_AFTER, HeaderValue::from(retry)));
        }
        headers
    }

    pub fn apply_to(&self, map: &mut HeaderMap) {
        for (name, value) in self.headers() {
            map.insert(name, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(allowed: bool, retry_after_secs: f64) -> RateLimitDecision {
        RateLimitDecision {
            allowed,
            remaining: if allowed { 4 } else { 0 },
            limit: 10,
            reset_at: 1_700_000_060,
            retry_after_secs,
            denial: match (allowed, retry_after_secs.is_finite()) {
                (true, _) => None,
                (false, true) => Some(Denial::QuotaExceeded),
                (false, false) => Some(Denial::CostExceedsCapacity),
            },
            source: PolicySource::Endpoint,
            window_secs: 60.0,
        }
    }

    #[test]
    fn allowed_decision_has_three_headers() {
        let mut map = HeaderMap::new();
        decision(true, 0.0).apply_to(&mut map);

        assert_eq!(map.len(), 3);
        assert_eq!(map["X-RateLimit-Limit"], "10");
        assert_eq!(map["X-RateLimit-Remaining"], "4");
        assert_eq!(map["X-RateLimit-Reset"], "1700000060");
        assert!(map.get("Retry-After").is_none());
        assert_eq!(decision(true, 0.0).status(), StatusCode::OK);
    }

    #[test]
    fn denied_decision_rounds_retry_after_up() {
        let d = decision(false, 5.2);
        let mut map = HeaderMap::new();
        d.apply_to(&mut map);

        assert_eq!(d.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(map["Retry-After"], "6");
        assert_eq!(map["X-RateLimit-Remaining"], "0");
    }

    #[test]
    fn sub_second_retry_reports_one() {
        assert_eq!(decision(false, 0.2).retry_after_header(), Some(1));
    }

    #[test]
    fn permanent_denial_reports_window() {
        let d = decision(false, f64::INFINITY);
        assert!(d.is_permanent());
        assert_eq!(d.retry_after_header(), Some(60));
    }
}
