//! Admission gate middleware.
//!
//! Every request is charged to its subject by the rate limiter, then waits
//! for a scheduler slot when the system is saturated. Denials short-circuit
//! with `429` and the rate-limit headers; admitted responses carry the same
//! headers.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use admission_admin::state::SharedState;
use admission_rate_limit::{RateLimitDecision, Subject};
use admission_scheduler::{DispatchPermit, Priority, SchedulerError};
use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use http::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use http::StatusCode;
use serde_json::json;
use tracing::{debug, warn};

pub const X_USER_ID: HeaderName = HeaderName::from_static("x-user-id");
pub const X_ENDPOINT_ID: HeaderName = HeaderName::from_static("x-endpoint-id");
pub const X_PRIORITY: HeaderName = HeaderName::from_static("x-priority");
pub const X_REQUEST_COST: HeaderName = HeaderName::from_static("x-request-cost");
pub const X_SESSION_ID: HeaderName = HeaderName::from_static("x-session-id");
pub const X_MAX_WAIT_MS: HeaderName = HeaderName::from_static("x-max-wait-ms");
pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// What the routing layer tells us about a request.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub subject: Subject,
    pub endpoint: String,
    pub priority: Priority,
    pub cost: u64,
    pub max_wait: Option<Duration>,
}

impl Inbound {
    pub fn from_parts(headers: &HeaderMap, path: &str, peer: Option<IpAddr>) -> Self {
        let client_ip = header_str(headers, &X_FORWARDED_FOR)
            .and_then(|list| list.split(',').next())
            .and_then(|first| first.trim().parse::<IpAddr>().ok())
            .or(peer);

        let subject = Subject::resolve(
            header_str(headers, &X_USER_ID),
            header_str(headers, &X_SESSION_ID),
            client_ip,
        );

        let priority = match header_str(headers, &X_PRIORITY) {
            Some(raw) => raw.parse().unwrap_or_else(|e| {
                debug!(error = %e, "ignoring malformed priority header");
                Priority::Normal
            }),
            None => Priority::Normal,
        };

        Self {
            subject,
            endpoint: header_str(headers, &X_ENDPOINT_ID)
                .filter(|id| !id.is_empty())
                .unwrap_or(path)
                .to_string(),
            priority,
            cost: header_str(headers, &X_REQUEST_COST)
                .and_then(|raw| raw.trim().parse().ok())
                .unwrap_or(1),
            max_wait: header_str(headers, &X_MAX_WAIT_MS)
                .and_then(|raw| raw.trim().parse().ok())
                .map(Duration::from_millis),
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok()).map(str::trim)
}

/// Axum middleware enforcing the rate limit and concurrency ceiling.
pub async fn admit(State(state): State<SharedState>, request: Request, next: Next) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let inbound = Inbound::from_parts(request.headers(), request.uri().path(), peer);
    let metrics = &state.metrics;

    let decision = state
        .limiter
        .check(&inbound.subject, &inbound.endpoint, inbound.cost);
    if !decision.allowed {
        let outcome = if decision.is_permanent() { "rejected" } else { "denied" };
        metrics.checks_total.with_label_values(&[outcome]).inc();
        return denied(&decision);
    }
    metrics.checks_total.with_label_values(&["allowed"]).inc();

    let permit = match acquire(&state, &inbound).await {
        Ok(permit) => permit,
        Err(reason) => {
            let outcome = match reason {
                SchedulerError::Timeout => "timeout",
                SchedulerError::Shutdown => "shutdown",
                SchedulerError::Cancelled => "cancelled",
                SchedulerError::QueueFull { .. } => "queue_full",
            };
            metrics.scheduled_total.with_label_values(&[outcome]).inc();
            warn!(
                subject = %inbound.subject,
                endpoint = %inbound.endpoint,
                priority = %inbound.priority,
                %reason,
                "request not dispatched"
            );
            return not_dispatched(&decision, reason);
        }
    };

    let mut response = next.run(request).await;
    drop(permit);
    decision.apply_to(response.headers_mut());
    response
}

async fn acquire(state: &SharedState, inbound: &Inbound) -> Result<DispatchPermit, SchedulerError> {
    let scheduler = &state.scheduler;
    if let Some(permit) = scheduler.try_acquire() {
        state
            .metrics
            .scheduled_total
            .with_label_values(&["immediate"])
            .inc();
        return Ok(permit);
    }

    // Callers may ask for a shorter wait, never a longer one.
    let default_wait = scheduler.default_max_wait();
    let max_wait = inbound.max_wait.map_or(default_wait, |wait| wait.min(default_wait));

    let started = Instant::now();
    let handle = scheduler.enqueue(inbound.subject.key(&inbound.endpoint), inbound.priority, max_wait)?;
    let permit = handle.wait().await?;

    state
        .metrics
        .queue_wait_seconds
        .observe(started.elapsed().as_secs_f64());
    state
        .metrics
        .scheduled_total
        .with_label_values(&["queued"])
        .inc();
    Ok(permit)
}

fn denied(decision: &RateLimitDecision) -> Response {
    let body = json!({
        "error": if decision.is_permanent() { "cost_exceeds_capacity" } else { "rate_limited" },
        "retry_after_secs": decision.retry_after_header(),
        "limit": decision.limit,
    });
    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    decision.apply_to(response.headers_mut());
    response
}

fn not_dispatched(decision: &RateLimitDecision, reason: SchedulerError) -> Response {
    let body = json!({
        "error": "not_dispatched",
        "reason": reason.to_string(),
        "retry_after_secs": 1,
    });
    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    let headers = response.headers_mut();
    decision.apply_to(headers);
    headers.insert(RETRY_AFTER, HeaderValue::from_static("1"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use admission_admin::AppState;
    use admission_common::{AppConfig, RateLimit, SchedulerConfig};
    use admission_rate_limit::{AdaptiveThrottler, RateLimiter};
    use admission_scheduler::RequestScheduler;
    use axum::body::Body;
    use axum::middleware;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    fn state(capacity: u64, max_concurrent: usize) -> SharedState {
        let mut config = AppConfig::default();
        config.rate_limit.global = RateLimit::new(capacity, 60.0, 0);
        config.scheduler = SchedulerConfig {
            max_concurrent,
            default_max_wait_ms: 200,
            ..SchedulerConfig::default()
        };
        let limiter =
            RateLimiter::new(&config.rate_limit, Arc::new(AdaptiveThrottler::disabled())).unwrap();
        let scheduler = RequestScheduler::new(&config.scheduler);
        Arc::new(AppState::new(config, None, limiter, scheduler, None).unwrap())
    }

    fn app(state: SharedState) -> Router {
        Router::new()
            .route("/work", get(|| async { "done" }))
            .layer(middleware::from_fn_with_state(state, admit))
    }

    fn request(user: &str) -> Request {
        http::Request::builder()
            .uri("/work")
            .header("x-user-id", user)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn inbound_defaults() {
        let headers = HeaderMap::new();
        let peer: IpAddr = "198.51.100.7".parse().unwrap();
        let inbound = Inbound::from_parts(&headers, "/orders", Some(peer));

        assert_eq!(inbound.subject, Subject::anonymous_ip(peer));
        assert_eq!(inbound.endpoint, "/orders");
        assert_eq!(inbound.priority, Priority::Normal);
        assert_eq!(inbound.cost, 1);
        assert_eq!(inbound.max_wait, None);
    }

    #[test]
    fn inbound_reads_routing_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(X_USER_ID, HeaderValue::from_static("alice"));
        headers.insert(X_ENDPOINT_ID, HeaderValue::from_static("search"));
        headers.insert(X_PRIORITY, HeaderValue::from_static("critical"));
        headers.insert(X_REQUEST_COST, HeaderValue::from_static("5"));
        headers.insert(X_MAX_WAIT_MS, HeaderValue::from_static("250"));

        let inbound = Inbound::from_parts(&headers, "/ignored", None);
        assert_eq!(inbound.subject, Subject::user("alice"));
        assert_eq!(inbound.endpoint, "search");
        assert_eq!(inbound.priority, Priority::Critical);
        assert_eq!(inbound.cost, 5);
        assert_eq!(inbound.max_wait, Some(Duration::from_millis(250)));
    }

    #[test]
    fn forwarded_for_beats_socket_address() {
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("203.0.113.1, 10.0.0.1"));
        headers.insert(X_PRIORITY, HeaderValue::from_static("urgent"));

        let inbound = Inbound::from_parts(&headers, "/", Some("10.0.0.1".parse().unwrap()));
        assert_eq!(inbound.subject, Subject::anonymous_ip("203.0.113.1".parse().unwrap()));
        assert_eq!(inbound.priority, Priority::Normal);
    }

    #[tokio::test]
    async fn admitted_responses_carry_rate_limit_headers() {
        let state = state(2, 4);
        let response = app(state).oneshot(request("alice")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers["x-ratelimit-limit"], "2");
        assert_eq!(headers["x-ratelimit-remaining"], "1");
        assert!(headers.contains_key("x-ratelimit-reset"));
        assert!(!headers.contains_key("retry-after"));
    }

    #[tokio::test]
    async fn exhausted_quota_short_circuits_with_429() {
        let state = state(1, 4);
        let router = app(Arc::clone(&state));
        assert_eq!(router.clone().oneshot(request("bob")).await.unwrap().status(), StatusCode::OK);

        let response = router.oneshot(request("bob")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["x-ratelimit-remaining"], "0");
        assert_eq!(response.headers()["retry-after"], "60");
        assert_eq!(
            state.metrics.checks_total.with_label_values(&["denied"]).get(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn saturated_scheduler_times_out_with_retry_after_one() {
        let state = state(10, 1);
        let _busy = state.scheduler.try_acquire().unwrap();

        let response = app(Arc::clone(&state)).oneshot(request("carol")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["retry-after"], "1");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "9");
        assert_eq!(
            state.metrics.scheduled_total.with_label_values(&["timeout"]).get(),
            1
        );
        assert_eq!(state.scheduler.queue_depth(), 0);
    }

    #[tokio::test]
    async fn permit_is_released_after_the_handler() {
        let state = state(10, 1);
        let router = app(Arc::clone(&state));
        for user in ["a", "b", "c"] {
            assert_eq!(router.clone().oneshot(request(user)).await.unwrap().status(), StatusCode::OK);
        }
        assert_eq!(state.scheduler.in_flight(), 0);
    }
}
