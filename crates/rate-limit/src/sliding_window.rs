use std::time::{Duration, Instant};

/// Result of a single [`SlidingWindowCounter::record_and_check_at`] call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowOutcome {
    pub allowed: bool,
    /// Weighted estimate of requests in the trailing window, rounded up.
    /// Includes this request when it was allowed.
    pub count_in_window: u64,
    pub remaining: u64,
    pub retry_after_secs: f64,
    /// Seconds until the current fixed window rolls over.
    pub resets_in_secs: f64,
}

/// Two-window approximation of a sliding window counter.
///
/// The count for the trailing window is estimated as
/// `previous * (1 - elapsed_fraction) + current`, which assumes the previous
/// window's events were spread evenly across it. The error is bounded by the
/// previous window's count times the elapsed fraction of the current window,
/// i.e. never more than one sub-window's worth, in exchange for O(1) memory
/// per subject.
#[derive(Debug, Clone)]
pub struct SlidingWindowCounter {
    current_count: u64,
    previous_count: u64,
    window_start: Instant,
}

/// Window counts as seen at a given instant, after any roll-over.
#[derive(Debug, Clone, Copy)]
struct View {
    previous: u64,
    current: u64,
    start: Instant,
    fraction: f64,
}

impl View {
    fn estimate(&self) -> f64 {
        self.previous as f64 * (1.0 - self.fraction) + self.current as f64
    }
}

impl SlidingWindowCounter {
    pub fn new(now: Instant) -> Self {
        Self {
            current_count: 0,
            previous_count: 0,
            window_start: now,
        }
    }

    fn view_at(&self, window: Duration, now: Instant) -> View {
        let window_secs = window.as_secs_f64();
        let elapsed = now.saturating_duration_since(self.window_start).as_secs_f64();

        let (previous, current, start) = if elapsed >= window_secs {
            // More than one full window idle means the previous window is empty too.
            let rolled = (elapsed / window_secs).floor();
            let previous = if rolled < 2.0 { self.current_count } else { 0 };
            let start = self.window_start + Duration::from_secs_f64(window_secs * rolled);
            (previous, 0, start)
        } else {
            (self.previous_count, self.current_count, self.window_start)
        };

        let into_window = now.saturating_duration_since(start).as_secs_f64();
        View {
            previous,
            current,
            start,
            fraction: (into_window / window_secs).clamp(0.0, 1.0),
        }
    }

    /// Weighted request count for the trailing window ending at `now`.
    pub fn estimate_at(&self, window: Duration, now: Instant) -> f64 {
        self.view_at(window, now).estimate()
    }

    /// Record `cost` requests if they fit under `limit`.
    ///
    /// Like the token bucket, a denied call writes nothing back.
    pub fn record_and_check_at(
        &mut self,
        limit: u64,
        window: Duration,
        cost: u64,
        now: Instant,
    ) -> WindowOutcome {
        let view = self.view_at(window, now);
        let estimate = view.estimate();
        let window_secs = window.as_secs_f64();
        let resets_in_secs = (1.0 - view.fraction) * window_secs;

        // A single-unit request is allowed while the estimate is below the
        // limit; larger costs need room for all but their last unit.
        let fits = cost <= limit && estimate + (cost.saturating_sub(1) as f64) < limit as f64;

        if fits {
            self.previous_count = view.previous;
            self.current_count = view.current + cost;
            self.window_start = view.start;

            let after = estimate + cost as f64;
            WindowOutcome {
                allowed: true,
                count_in_window: after.ceil() as u64,
                remaining: (limit as f64 - after).max(0.0).floor() as u64,
                retry_after_secs: 0.0,
                resets_in_secs,
            }
        } else {
            let retry_after_secs = if cost > limit {
                f64::INFINITY
            } else {
                retry_after(&view, limit, cost, window_secs)
            };
            WindowOutcome {
                allowed: false,
                count_in_window: estimate.ceil() as u64,
                remaining: (limit as f64 - estimate).max(0.0).floor() as u64,
                retry_after_secs,
                resets_in_secs,
            }
        }
    }
}

/// Time until `cost` units would fit, assuming no further traffic.
fn retry_after(view: &View, limit: u64, cost: u64, window_secs: f64) -> f64 {
    let headroom = limit as f64 - cost as f64 + 1.0;

    // Room left in this window once the decaying previous count is ignored.
    let room = headroom - view.current as f64;
    if room > 0.0 && view.previous > 0 {
        let needed_fraction = 1.0 - room / view.previous as f64;
        return ((needed_fraction - view.fraction) * window_secs).max(0.0);
    }

    // Otherwise wait for the roll-over, after which the current count decays.
    let until_roll = (1.0 - view.fraction) * window_secs;
    let next_fraction = if view.current == 0 {
        0.0
    } else {
        (1.0 - headroom / view.current as f64).max(0.0)
    };
    until_roll + next_fraction * window_secs
}
