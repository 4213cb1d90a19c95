use std::sync::Arc;

use admission_common::{RateLimit, ThrottleConfig};
use arc_swap::ArcSwap;

use crate::load::LoadSignal;

/// Scales policies with system load.
///
/// Scaling happens per check on a copy of the resolved policy. Stored
/// policies and subject state are never rewritten, so once load drops the
/// next check sees the base policy again.
pub struct AdaptiveThrottler {
    config: ArcSwap<ThrottleConfig>,
    signal: Option<Arc<dyn LoadSignal>>,
}

impl AdaptiveThrottler {
    pub fn new(config: ThrottleConfig, signal: Arc<dyn LoadSignal>) -> Self {
        Self {
            config: ArcSwap::from_pointee(config),
            signal: Some(signal),
        }
    }

    /// A throttler that always hands back the base policy.
    pub fn disabled() -> Self {
        Self {
            config: ArcSwap::from_pointee(ThrottleConfig {
                enabled: false,
                ..ThrottleConfig::default()
            }),
            signal: None,
        }
    }

    pub fn update_config(&self, config: ThrottleConfig) {
        self.config.store(Arc::new(config));
    }

    /// Load factor in effect, or `None` when throttling is off or the load
    /// signal is degraded.
    pub fn current_load(&self) -> Option<f64> {
        if !self.config.load().enabled {
            return None;
        }
        self.signal.as_ref()?.load_factor()
    }

    pub fn is_active(&self) -> bool {
        self.current_load().is_some()
    }

    pub fn scale_limit(&self, base: &RateLimit) -> RateLimit {
        match self.current_load() {
            Some(load) => scale_for_load(&self.config.load(), base, load),
            None => *base,
        }
    }
}

/// Apply the load curve to `base`.
///
/// Above `high_water` capacity and burst shrink linearly, reaching
/// `min_scale` at `saturation` and staying there. Below `low_water` extra
/// burst grows linearly up to `max_headroom * capacity` at zero load.
pub fn scale_for_load(config: &ThrottleConfig, base: &RateLimit, load: f64) -> RateLimit {
    let load = if load.is_finite() { load.clamp(0.0, 1.0) } else { 0.0 };

    if load > config.high_water {
        let span = (config.saturation - config.high_water).max(f64::EPSILON);
        let progress = ((load - config.high_water) / span).min(1.0);
        let scale = 1.0 - (1.0 - config.min_scale) * progress;
        return RateLimit {
            capacity: ((base.capacity as f64 * scale).round() as u64).max(1),
            window_secs: base.window_secs,
            burst: (base.burst as f64 * scale).round() as u64,
        };
    }

    if load < config.low_water && config.low_water > 0.0 {
        let headroom = config.max_headroom * (config.low_water - load) / config.low_water;
        let extra = (base.capacity as f64 * headroom).round() as u64;
        return RateLimit {
            burst: base.burst.saturating_add(extra),
            ..*base
        };
    }

    *base
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FixedLoad(Mutex<Option<f64>>);

    impl FixedLoad {
        fn new(load: Option<f64>) -> Arc<Self> {
            Arc::new(Self(Mutex::new(load)))
        }

        fn set(&self, load: Option<f64>) {
            *self.0.lock().unwrap() = load;
        }
    }

    impl LoadSignal for FixedLoad {
        fn load_factor(&self) -> Option<f64> {
            *self.0.lock().unwrap()
        }
    }

    fn base() -> RateLimit {
        RateLimit::new(100, 60.0, 10)
    }

    #[test]
    fn heavy_load_halves_capacity() {
        let scaled = scale_for_load(&ThrottleConfig::default(), &base(), 0.95);
        assert_eq!(scaled.capacity, 50);
        assert_eq!(scaled.burst, 5);
        assert_eq!(scaled.window_secs, 60.0);
    }

    #[test]
    fn reduction_is_linear_and_floored() {
        let config = ThrottleConfig::default();
        assert_eq!(scale_for_load(&config, &base(), 0.90).capacity, 75);
        assert_eq!(scale_for_load(&config, &base(), 1.0).capacity, 50);
        assert_eq!(scale_for_load(&config, &base(), 0.85).capacity, 100);
    }

    #[test]
    fn light_load_adds_burst_headroom() {
        let config = ThrottleConfig::default();
        let idle = scale_for_load(&config, &base(), 0.0);
        assert_eq!(idle.capacity, 100);
        assert_eq!(idle.burst, 30);

        let half = scale_for_load(&config, &base(), 0.15);
        assert_eq!(half.burst, 20);
    }

    #[test]
    fn moderate_load_is_untouched() {
        assert_eq!(scale_for_load(&ThrottleConfig::default(), &base(), 0.5), base());
    }

    #[test]
    fn capacity_never_reaches_zero() {
        let tiny = RateLimit::new(1, 1.0, 0);
        assert_eq!(scale_for_load(&ThrottleConfig::default(), &tiny, 1.0).capacity, 1);
    }

    #[test]
    fn degraded_signal_falls_back_to_base() {
        let signal = FixedLoad::new(Some(0.99));
        let throttler = AdaptiveThrottler::new(ThrottleConfig::default(), signal.clone());
        assert_eq!(throttler.scale_limit(&base()).capacity, 50);

        signal.set(None);
        assert!(!throttler.is_active());
        assert_eq!(throttler.scale_limit(&base()), base());
    }

    #[test]
    fn disabled_config_ignores_load() {
        let throttler = AdaptiveThrottler::new(ThrottleConfig::default(), FixedLoad::new(Some(1.0)));
        throttler.update_config(ThrottleConfig {
            enabled: false,
            ..ThrottleConfig::default()
        });
        assert_eq!(throttler.scale_limit(&base()), base());
        assert_eq!(AdaptiveThrottler::disabled().scale_limit(&base()), base());
    }
}
