use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{AdmissionError, AdmissionResult};

/// Top-level admission daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub load: LoadConfig,
    #[serde(default)]
    pub throttle: ThrottleConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the admission gate listens on.
    #[serde(default = "default_gate_listen")]
    pub listen: String,
    #[serde(default)]
    pub admin: AdminConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_gate_listen(),
            admin: AdminConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_admin_listen")]
    pub listen: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            listen: default_admin_listen(),
        }
    }
}

/// Longest accepted policy window: one year.
pub const MAX_WINDOW_SECS: f64 = 365.0 * 24.0 * 3600.0;

/// "N requests per `window_secs`, with `burst` extra capacity."
///
/// Policies are plain values: a reload replaces them wholesale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    pub capacity: u64,
    pub window_secs: f64,
    #[serde(default)]
    pub burst: u64,
}

impl RateLimit {
    pub fn new(capacity: u64, window_secs: f64, burst: u64) -> Self {
        Self {
            capacity,
            window_secs,
            burst,
        }
    }

    /// Tokens regained per second.
    pub fn refill_rate(&self) -> f64 {
        self.capacity as f64 / self.window_secs
    }

    /// The window as a `Duration`, clamped to `MAX_WINDOW_SECS`.
    pub fn window(&self) -> Duration {
        Duration::try_from_secs_f64(self.window_secs.min(MAX_WINDOW_SECS))
            .unwrap_or(Duration::from_secs(1))
    }

    /// Upper bound on what a subject can hold: `capacity + burst`.
    pub fn ceiling(&self) -> u64 {
        self.capacity.saturating_add(self.burst)
    }

    pub fn validate(&self, scope: &str) -> AdmissionResult<()> {
        if self.capacity == 0 {
            return Err(AdmissionError::invalid_policy(scope, "capacity must be at least 1"));
        }
        if !self.window_secs.is_finite() || self.window_secs <= 0.0 {
            return Err(AdmissionError::invalid_policy(
                scope,
                format!("window_secs must be a positive number, got {}", self.window_secs),
            ));
        }
        if self.window_secs > MAX_WINDOW_SECS {
            return Err(AdmissionError::invalid_policy(
                scope,
                format!(
                    "window_secs must be at most {} (one year), got {}",
                    MAX_WINDOW_SECS, self.window_secs
                ),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithm {
    /// Burst-tolerant, smooth refill.
    #[default]
    TokenBucket,
    /// Strict counting over a rolling window.
    SlidingWindow,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EndpointPolicy {
    #[serde(flatten)]
    pub limit: RateLimit,
    #[serde(default)]
    pub algorithm: RateLimitAlgorithm,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_global_limit")]
    pub global: RateLimit,
    /// Applied to callers without a resolved user id.
    #[serde(default = "default_anonymous_limit")]
    pub anonymous: RateLimit,
    #[serde(default)]
    pub endpoints: BTreeMap<String, EndpointPolicy>,
    #[serde(default = "default_idle_ttl")]
    pub idle_ttl_secs: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global: default_global_limit(),
            anonymous: default_anonymous_limit(),
            endpoints: BTreeMap::new(),
            idle_ttl_secs: default_idle_ttl(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

impl RateLimitConfig {
    /// Reject the whole table if any entry is malformed.
    pub fn validate(&self) -> AdmissionResult<()> {
        self.global.validate("global")?;
        self.anonymous.validate("anonymous")?;
        for (endpoint, policy) in &self.endpoints {
            if endpoint.trim().is_empty() {
                return Err(AdmissionError::invalid_policy(
                    "endpoints",
                    "endpoint id must not be empty",
                ));
            }
            policy.limit.validate(&format!("endpoint '{}'", endpoint))?;
        }
        if self.idle_ttl_secs == 0 {
            return Err(AdmissionError::Config(
                "rate_limit.idle_ttl_secs must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadConfig {
    #[serde(default = "default_sample_interval")]
    pub interval_ms: u64,
    #[serde(default = "default_cpu_weight")]
    pub cpu_weight: f64,
    #[serde(default = "default_queue_weight")]
    pub queue_weight: f64,
    /// Queue depth treated as fully loaded.
    #[serde(default = "default_queue_depth_ceiling")]
    pub queue_depth_ceiling: usize,
    /// Consecutive sampling failures before throttling is suspended.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_smoothing_samples")]
    pub smoothing_samples: usize,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_sample_interval(),
            cpu_weight: default_cpu_weight(),
            queue_weight: default_queue_weight(),
            queue_depth_ceiling: default_queue_depth_ceiling(),
            failure_threshold: default_failure_threshold(),
            smoothing_samples: default_smoothing_samples(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Load factor above which capacity starts shrinking.
    #[serde(default = "default_high_water")]
    pub high_water: f64,
    /// Load factor at which the minimum scale is reached.
    #[serde(default = "default_saturation")]
    pub saturation: f64,
    #[serde(default = "default_min_scale")]
    pub min_scale: f64,
    /// Load factor below which extra burst headroom is granted.
    #[serde(default = "default_low_water")]
    pub low_water: f64,
    /// Extra burst, as a fraction of capacity, granted at zero load.
    #[serde(default = "default_max_headroom")]
    pub max_headroom: f64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            high_water: default_high_water(),
            saturation: default_saturation(),
            min_scale: default_min_scale(),
            low_water: default_low_water(),
            max_headroom: default_max_headroom(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_max_wait")]
    pub default_max_wait_ms: u64,
    /// Fraction of `max_wait` after which a queued request is promoted once.
    #[serde(default = "default_starvation_ratio")]
    pub starvation_ratio: f64,
    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: usize,
    #[serde(default = "default_tick")]
    pub tick_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            default_max_wait_ms: default_max_wait(),
            starvation_ratio: default_starvation_ratio(),
            max_queue_depth: default_max_queue_depth(),
            tick_ms: default_tick(),
        }
    }
}

// Default value helpers
fn default_gate_listen() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_admin_listen() -> String {
    "127.0.0.1:9090".to_string()
}
fn default_true() -> bool {
    true
}
fn default_global_limit() -> RateLimit {
    RateLimit::new(100, 60.0, 20)
}
fn default_anonymous_limit() -> RateLimit {
    RateLimit::new(20, 60.0, 0)
}
fn default_idle_ttl() -> u64 {
    3600
}
fn default_cleanup_interval() -> u64 {
    60
}
fn default_sample_interval() -> u64 {
    2000
}
fn default_cpu_weight() -> f64 {
    0.7
}
fn default_queue_weight() -> f64 {
    0.3
}
fn default_queue_depth_ceiling() -> usize {
    100
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_smoothing_samples() -> usize {
    5
}
fn default_high_water() -> f64 {
    0.85
}
fn default_saturation() -> f64 {
    0.95
}
fn default_min_scale() -> f64 {
    0.5
}
fn default_low_water() -> f64 {
    0.3
}
fn default_max_headroom() -> f64 {
    0.2
}
fn default_max_concurrent() -> usize {
    64
}
fn default_max_wait() -> u64 {
    5000
}
fn default_starvation_ratio() -> f64 {
    0.8
}
fn default_max_queue_depth() -> usize {
    10_000
}
fn default_tick() -> u64 {
    50
}

impl AppConfig {
    /// Load configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> AdmissionResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> AdmissionResult<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration for consistency.
    pub fn validate(&self) -> AdmissionResult<()> {
        self.rate_limit.validate()?;

        let load = &self.load;
        if load.interval_ms == 0 {
            return Err(AdmissionError::Config("load.interval_ms must be greater than zero".into()));
        }
        if load.cpu_weight < 0.0 || load.queue_weight < 0.0 {
            return Err(AdmissionError::Config("load weights must not be negative".into()));
        }
        if load.cpu_weight + load.queue_weight <= 0.0 {
            return Err(AdmissionError::Config(
                "load.cpu_weight and load.queue_weight must not both be zero".into(),
            ));
        }
        if load.queue_depth_ceiling == 0 {
            return Err(AdmissionError::Config(
                "load.queue_depth_ceiling must be greater than zero".into(),
            ));
        }

        let t = &self.throttle;
        if !(0.0 <= t.low_water && t.low_water < t.high_water && t.high_water < t.saturation && t.saturation <= 1.0) {
            return Err(AdmissionError::Config(format!(
                "throttle thresholds must satisfy 0 <= low_water < high_water < saturation <= 1 \
                 (got {}, {}, {})",
                t.low_water, t.high_water, t.saturation
            )));
        }
        if !(0.0 < t.min_scale && t.min_scale <= 1.0) {
            return Err(AdmissionError::Config("throttle.min_scale must be in (0, 1]".into()));
        }
        if t.max_headroom < 0.0 {
            return Err(AdmissionError::Config("throttle.max_headroom must not be negative".into()));
        }

        let s = &self.scheduler;
        if s.max_concurrent == 0 {
            return Err(AdmissionError::Config(
                "scheduler.max_concurrent must be at least 1".into(),
            ));
        }
        if !(0.0 < s.starvation_ratio && s.starvation_ratio <= 1.0) {
            return Err(AdmissionError::Config(
                "scheduler.starvation_ratio must be in (0, 1]".into(),
            ));
        }
        if s.tick_ms == 0 {
            return Err(AdmissionError::Config("scheduler.tick_ms must be greater than zero".into()));
        }

        Ok(())
    }
}
