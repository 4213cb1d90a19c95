use std::path::PathBuf;
use std::sync::{Arc, RwLock, RwLockReadGuard};

use admission_common::{AdmissionError, AdmissionResult, AppConfig};
use admission_rate_limit::{LoadSampler, RateLimiter};
use admission_scheduler::RequestScheduler;
use prometheus::{
    Gauge, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry,
};

/// Shared state type alias used across all route handlers.
pub type SharedState = Arc<AppState>;

/// Everything the admin API and the admission gate share.
pub struct AppState {
    pub config: RwLock<AppConfig>,
    /// File the configuration was loaded from, for reloads.
    pub config_path: Option<PathBuf>,
    pub limiter: RateLimiter,
    pub scheduler: RequestScheduler,
    pub sampler: Option<Arc<LoadSampler>>,
    pub metrics: AdmissionMetrics,
    pub start_time: std::time::Instant,
}

/// Prometheus metrics for admission decisions.
pub struct AdmissionMetrics {
    pub registry: Registry,
    /// `outcome`: allowed, denied, rejected (permanent denial).
    pub checks_total: IntCounterVec,
    /// `outcome`: immediate, queued, timeout, shutdown, cancelled, queue_full.
    pub scheduled_total: IntCounterVec,
    pub queue_wait_seconds: Histogram,
    pub load_factor: Gauge,
    pub subjects_tracked: IntGauge,
    pub queue_depth: IntGauge,
}

impl AdmissionMetrics {
    /// Create every collector and register it against a fresh registry.
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let checks_total = IntCounterVec::new(
            Opts::new("admission_checks_total", "Rate limit checks by outcome"),
            &["outcome"],
        )?;

        let scheduled_total = IntCounterVec::new(
            Opts::new("admission_scheduled_total", "Scheduler admissions by outcome"),
            &["outcome"],
        )?;

        let queue_wait_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "admission_queue_wait_seconds",
                "Time admitted requests spent waiting for a dispatch slot",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0, 30.0]),
        )?;

        let load_factor = Gauge::with_opts(Opts::new(
            "admission_load_factor",
            "Latest combined CPU and queue load factor",
        ))?;

        let subjects_tracked = IntGauge::with_opts(Opts::new(
            "admission_subjects_tracked",
            "Subject keys with live rate limit state",
        ))?;

        let queue_depth = IntGauge::with_opts(Opts::new(
            "admission_queue_depth",
            "Requests waiting in the scheduler queue",
        ))?;

        registry.register(Box::new(checks_total.clone()))?;
        registry.register(Box::new(scheduled_total.clone()))?;
        registry.register(Box::new(queue_wait_seconds.clone()))?;
        registry.register(Box::new(load_factor.clone()))?;
        registry.register(Box::new(subjects_tracked.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;

        Ok(Self {
            registry,
            checks_total,
            scheduled_total,
            queue_wait_seconds,
            load_factor,
            subjects_tracked,
            queue_depth,
        })
    }
}

impl AppState {
    pub fn new(
        config: AppConfig,
        config_path: Option<PathBuf>,
        limiter: RateLimiter,
        scheduler: RequestScheduler,
        sampler: Option<Arc<LoadSampler>>,
    ) -> prometheus::Result<Self> {
        Ok(Self {
            config: RwLock::new(config),
            config_path,
            limiter,
            scheduler,
            sampler,
            metrics: AdmissionMetrics::new()?,
            start_time: std::time::Instant::now(),
        })
    }

    pub fn config(&self) -> RwLockReadGuard<'_, AppConfig> {
        self.config.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn load_factor(&self) -> f64 {
        self.sampler
            .as_ref()
            .map_or(0.0, |sampler| sampler.current_load_factor())
    }

    /// Copy live values into the gauges before they are scraped.
    pub fn refresh_gauges(&self) {
        self.metrics.load_factor.set(self.load_factor());
        self.metrics
            .subjects_tracked
            .set(self.limiter.subjects_tracked() as i64);
        self.metrics
            .queue_depth
            .set(self.scheduler.queue_depth() as i64);
    }

    /// Validate `new_config` and push it into the running components.
    ///
    /// Policies, throttle curve and concurrency apply immediately. Listen
    /// addresses and sampler settings only take effect on restart.
    pub fn apply_config(&self, new_config: AppConfig) -> AdmissionResult<()> {
        new_config.validate()?;
        self.limiter.reload_policies(&new_config.rate_limit)?;
        self.limiter
            .throttler()
            .update_config(new_config.throttle.clone());
        self.scheduler
            .set_max_concurrent(new_config.scheduler.max_concurrent);

        let mut config = self.config.write().unwrap_or_else(|e| e.into_inner());
        if config.server.listen != new_config.server.listen
            || config.server.admin.listen != new_config.server.admin.listen
        {
            tracing::warn!("listen address changes require a restart");
        }
        *config = new_config;
        tracing::info!("configuration applied");
        Ok(())
    }

    /// Re-read the configuration file and apply it.
    pub fn reload_from_disk(&self) -> AdmissionResult<()> {
        let path = self.config_path.as_ref().ok_or_else(|| {
            AdmissionError::Config("no configuration file to reload from".to_string())
        })?;
        tracing::info!(path = %path.display(), "reloading configuration");
        let config = AppConfig::load(path).inspect_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "configuration reload rejected, keeping previous");
        })?;
        self.apply_config(config)
    }
}
