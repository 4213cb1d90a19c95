//! Periodic load sampling.
//!
//! [`LoadSampler`] combines CPU utilisation and scheduler queue depth into a
//! single load factor in `[0, 1]`. The latest sample is published through an
//! `ArcSwap`, so request paths read it without taking a lock.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use admission_common::LoadConfig;
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sysinfo::System;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

/// One load measurement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadSnapshot {
    pub cpu_pct: f64,
    pub scheduler_queue_depth: usize,
    pub sampled_at: DateTime<Utc>,
}

/// Reads whole-system CPU utilisation as a percentage.
pub trait CpuProbe: Send {
    fn cpu_pct(&mut self) -> anyhow::Result<f64>;
}

/// `sysinfo`-backed CPU probe.
pub struct SysinfoCpu {
    system: System,
}

impl SysinfoCpu {
    pub fn new() -> Self {
        let mut system = System::new();
        // The first reading only establishes a baseline.
        system.refresh_cpu_usage();
        Self { system }
    }
}

impl Default for SysinfoCpu {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuProbe for SysinfoCpu {
    fn cpu_pct(&mut self) -> anyhow::Result<f64> {
        self.system.refresh_cpu_usage();
        if self.system.cpus().is_empty() {
            anyhow::bail!("operating system reported no CPUs");
        }
        let pct = self.system.global_cpu_usage() as f64;
        if !pct.is_finite() {
            anyhow::bail!("CPU usage reading is not a number");
        }
        Ok(pct.clamp(0.0, 100.0))
    }
}

/// Anything that can report how many requests are waiting for dispatch.
pub trait QueueDepth: Send + Sync {
    fn queue_depth(&self) -> usize;
}

impl<F> QueueDepth for F
where
    F: Fn() -> usize + Send + Sync,
{
    fn queue_depth(&self) -> usize {
        self()
    }
}

/// Current load as seen by the throttler.
pub trait LoadSignal: Send + Sync {
    /// `None` while the signal is unreliable; throttling is then suspended.
    fn load_factor(&self) -> Option<f64>;
}

#[derive(Debug)]
struct Published {
    snapshot: LoadSnapshot,
    load_factor: f64,
}

pub struct LoadSampler {
    config: LoadConfig,
    probe: Mutex<Box<dyn CpuProbe>>,
    queue: Arc<dyn QueueDepth>,
    current: ArcSwap<Published>,
    history: Mutex<VecDeque<f64>>,
    consecutive_failures: AtomicU32,
}

impl LoadSampler {
    pub fn new(config: LoadConfig, probe: Box<dyn CpuProbe>, queue: Arc<dyn QueueDepth>) -> Self {
        let initial = Published {
            snapshot: LoadSnapshot {
                cpu_pct: 0.0,
                scheduler_queue_depth: 0,
                sampled_at: Utc::now(),
            },
            load_factor: 0.0,
        };
        Self {
            config,
            probe: Mutex::new(probe),
            queue,
            current: ArcSwap::from_pointee(initial),
            history: Mutex::new(VecDeque::new()),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    /// Sampler backed by the operating system's CPU counters.
    pub fn with_system_cpu(config: LoadConfig, queue: Arc<dyn QueueDepth>) -> Self {
        Self::new(config, Box::new(SysinfoCpu::new()), queue)
    }

    /// Take one sample and publish it.
    ///
    /// The CPU probe may block on OS counters; [`spawn`](Self::spawn) calls
    /// this from the blocking pool. A failed CPU read reuses the last good
    /// value; it never propagates.
    pub fn sample(&self) -> LoadSnapshot {
        let previous = self.current.load();
        let reading = self.probe.lock().unwrap_or_else(|e| e.into_inner()).cpu_pct();

        let cpu_pct = match reading {
            Ok(pct) => {
                let failures = self.consecutive_failures.swap(0, Ordering::Relaxed);
                if failures >= self.config.failure_threshold {
                    info!(failures, "load sampling recovered, adaptive throttling resumed");
                }
                pct
            }
            Err(e) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures == self.config.failure_threshold {
                    warn!(
                        failures,
                        error = %e,
                        "load sampling keeps failing, adaptive throttling suspended"
                    );
                } else {
                    debug!(failures, error = %e, "load sample failed, reusing last value");
                }
                previous.snapshot.cpu_pct
            }
        };

        let snapshot = LoadSnapshot {
            cpu_pct,
            scheduler_queue_depth: self.queue.queue_depth(),
            sampled_at: Utc::now(),
        };
        let load_factor = self.smooth(self.raw_factor(&snapshot));

        trace!(
            cpu_pct = snapshot.cpu_pct,
            queue_depth = snapshot.scheduler_queue_depth,
            load_factor,
            "load sampled"
        );

        self.current.store(Arc::new(Published {
            snapshot: snapshot.clone(),
            load_factor,
        }));
        snapshot
    }

    /// Weighted combination of normalised CPU and queue depth.
    fn raw_factor(&self, snapshot: &LoadSnapshot) -> f64 {
        let cpu = (snapshot.cpu_pct / 100.0).clamp(0.0, 1.0);
        let queue = (snapshot.scheduler_queue_depth as f64
            / self.config.queue_depth_ceiling.max(1) as f64)
            .min(1.0);
        let total_weight = self.config.cpu_weight + self.config.queue_weight;
        if total_weight <= 0.0 {
            return 0.0;
        }
        ((self.config.cpu_weight * cpu + self.config.queue_weight * queue) / total_weight)
            .clamp(0.0, 1.0)
    }

    fn smooth(&self, raw: f64) -> f64 {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.push_back(raw);
        while history.len() > self.config.smoothing_samples.max(1) {
            history.pop_front();
        }
        history.iter().sum::<f64>() / history.len() as f64
    }

    pub fn latest(&self) -> LoadSnapshot {
        self.current.load().snapshot.clone()
    }

    pub fn current_load_factor(&self) -> f64 {
        self.current.load().load_factor
    }

    /// True once sampling has failed `failure_threshold` times in a row.
    pub fn is_degraded(&self) -> bool {
        self.consecutive_failures.load(Ordering::Relaxed) >= self.config.failure_threshold
    }

    /// Run [`sample`](Self::sample) every `interval_ms` until `shutdown` flips.
    pub fn spawn(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let sampler = Arc::clone(self);
        let period = Duration::from_millis(self.config.interval_ms.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval_ms = period.as_millis() as u64, "load sampler started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        // The sysinfo refresh reads /proc, so it runs on the blocking pool.
                        let worker = Arc::clone(&sampler);
                        if let Err(e) = tokio::task::spawn_blocking(move || worker.sample()).await {
                            warn!(error = %e, "load sample task failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("load sampler stopped");
        })
    }
}

impl LoadSignal for LoadSampler {
    fn load_factor(&self) -> Option<f64> {
        if self.is_degraded() {
            None
        } else {
            Some(self.current_load_factor())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Replays a fixed script of readings, then repeats the last one.
    struct ScriptedCpu {
        readings: VecDeque<anyhow::Result<f64>>,
    }

    impl ScriptedCpu {
        fn new(readings: Vec<anyhow::Result<f64>>) -> Box<Self> {
            Box::new(Self {
                readings: readings.into(),
            })
        }
    }

    impl CpuProbe for ScriptedCpu {
        fn cpu_pct(&mut self) -> anyhow::Result<f64> {
            self.readings
                .pop_front()
                .unwrap_or_else(|| Err(anyhow::anyhow!("script exhausted")))
        }
    }

    fn config() -> LoadConfig {
        LoadConfig {
            smoothing_samples: 1,
            ..LoadConfig::default()
        }
    }

    fn no_queue() -> Arc<dyn QueueDepth> {
        Arc::new(|| 0usize)
    }

    #[test]
    fn combines_cpu_and_queue_depth() {
        let depth = Arc::new(AtomicUsize::new(50));
        let depth_reader = Arc::clone(&depth);
        let queue: Arc<dyn QueueDepth> = Arc::new(move || depth_reader.load(Ordering::Relaxed));
        let sampler = LoadSampler::new(config(), ScriptedCpu::new(vec![Ok(100.0)]), queue);

        let snapshot = sampler.sample();
        assert_eq!(snapshot.cpu_pct, 100.0);
        assert_eq!(snapshot.scheduler_queue_depth, 50);
        // 0.7 * 1.0 + 0.3 * 0.5
        assert!((sampler.current_load_factor() - 0.85).abs() < 1e-9);
    }

    #[test]
    fn queue_contribution_saturates() {
        let queue: Arc<dyn QueueDepth> = Arc::new(|| 10_000usize);
        let sampler = LoadSampler::new(config(), ScriptedCpu::new(vec![Ok(0.0)]), queue);
        sampler.sample();
        assert!((sampler.current_load_factor() - 0.3).abs() < 1e-9);
    }

    #[test]
    fn failure_reuses_last_good_value() {
        let sampler = LoadSampler::new(
            config(),
            ScriptedCpu::new(vec![Ok(40.0), Err(anyhow::anyhow!("boom"))]),
            no_queue(),
        );
        sampler.sample();
        let snapshot = sampler.sample();
        assert_eq!(snapshot.cpu_pct, 40.0);
        assert!(!sampler.is_degraded());
        assert!(sampler.load_factor().is_some());
    }

    #[test]
    fn repeated_failures_suspend_the_signal_until_recovery() {
        let mut readings: Vec<anyhow::Result<f64>> = vec![Ok(50.0)];
        readings.extend((0..3).map(|_| Err(anyhow::anyhow!("no /proc"))));
        readings.push(Ok(20.0));
        let sampler = LoadSampler::new(config(), ScriptedCpu::new(readings), no_queue());

        sampler.sample();
        for _ in 0..3 {
            sampler.sample();
        }
        assert!(sampler.is_degraded());
        assert_eq!(sampler.load_factor(), None);

        sampler.sample();
        assert!(!sampler.is_degraded());
        assert!((sampler.load_factor().unwrap() - 0.14).abs() < 1e-9);
    }

    #[test]
    fn smoothing_averages_recent_samples() {
        let config = LoadConfig {
            smoothing_samples: 2,
            cpu_weight: 1.0,
            queue_weight: 0.0,
            ..LoadConfig::default()
        };
        let sampler = LoadSampler::new(
            config,
            ScriptedCpu::new(vec![Ok(0.0), Ok(100.0), Ok(100.0)]),
            no_queue(),
        );
        sampler.sample();
        sampler.sample();
        assert!((sampler.current_load_factor() - 0.5).abs() < 1e-9);
        sampler.sample();
        assert!((sampler.current_load_factor() - 1.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn background_task_samples_until_shutdown() {
        let config = LoadConfig {
            interval_ms: 100,
            ..config()
        };
        let readings = (0..100).map(|_| Ok(60.0)).collect();
        let sampler = Arc::new(LoadSampler::new(config, ScriptedCpu::new(readings), no_queue()));
        let (tx, rx) = watch::channel(false);

        let handle = sampler.spawn(rx);
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(sampler.latest().cpu_pct, 60.0);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    /// Records which thread each reading was taken on.
    struct ThreadRecordingCpu(Arc<Mutex<Vec<std::thread::ThreadId>>>);

    impl CpuProbe for ThreadRecordingCpu {
        fn cpu_pct(&mut self) -> anyhow::Result<f64> {
            self.0.lock().unwrap().push(std::thread::current().id());
            Ok(25.0)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn background_reads_stay_off_the_runtime_thread() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let config = LoadConfig {
            interval_ms: 100,
            ..config()
        };
        let sampler = Arc::new(LoadSampler::new(
            config,
            Box::new(ThreadRecordingCpu(Arc::clone(&seen))),
            no_queue(),
        ));
        let (tx, rx) = watch::channel(false);

        let handle = sampler.spawn(rx);
        tokio::time::sleep(Duration::from_millis(250)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        let runtime_thread = std::thread::current().id();
        let seen = seen.lock().unwrap();
        assert!(!seen.is_empty());
        assert!(seen.iter().all(|id| *id != runtime_thread));
        assert_eq!(sampler.latest().cpu_pct, 25.0);
    }
}
