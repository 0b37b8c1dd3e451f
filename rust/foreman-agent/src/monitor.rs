//! Resource monitor: samples host memory and CPU, gates task admission,
//! and escalates under sustained pressure.

use std::sync::Arc;

use parking_lot::Mutex;
use sysinfo::System;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::ResourceThresholds;
use crate::processor::TaskProcessor;

/// Pressure levels derived from the configured hard thresholds.
///
/// - `Warn` (80% of a hard threshold): log only
/// - `Critical` (at a hard threshold): reject new tasks
/// - `Danger` (10 points past a hard threshold): cancel the oldest active
///   task and initiate graceful shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResourceLevel {
    Normal,
    Warn,
    Critical,
    Danger,
}

/// One resource sample.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceSample {
    pub memory_pct: f64,
    pub cpu_pct: f64,
}

/// Samples host resources via sysinfo. CPU busy fraction comes from the
/// deltas between consecutive refreshes, so samples are only meaningful at
/// the configured cadence, not back to back.
pub struct ResourceMonitor {
    sys: Mutex<System>,
    thresholds: ResourceThresholds,
    last: Mutex<ResourceSample>,
}

impl ResourceMonitor {
    pub fn new(thresholds: ResourceThresholds) -> Self {
        Self {
            sys: Mutex::new(System::new()),
            thresholds,
            last: Mutex::new(ResourceSample::default()),
        }
    }

    /// Take a fresh sample and cache it.
    pub fn sample(&self) -> ResourceSample {
        let mut sys = self.sys.lock();
        sys.refresh_memory();
        sys.refresh_cpu_usage();
        let memory_pct = if sys.total_memory() == 0 {
            0.0
        } else {
            sys.used_memory() as f64 / sys.total_memory() as f64 * 100.0
        };
        let sample = ResourceSample {
            memory_pct,
            cpu_pct: f64::from(sys.global_cpu_usage()),
        };
        *self.last.lock() = sample;
        sample
    }

    /// The most recent sample without refreshing (heartbeat replies use
    /// this so they never block on sysinfo).
    pub fn last(&self) -> ResourceSample {
        *self.last.lock()
    }

    /// Classify a sample against the thresholds.
    pub fn level(&self, sample: ResourceSample) -> ResourceLevel {
        let memory_level = classify(
            sample.memory_pct,
            self.thresholds.max_memory_pct,
        );
        let cpu_level = classify(sample.cpu_pct, self.thresholds.max_cpu_pct);
        memory_level.max(cpu_level)
    }

    /// Admission gate for the task processor.
    pub fn can_accept_new_tasks(&self) -> bool {
        self.level(self.last()) < ResourceLevel::Critical
    }

    /// Spawn the sampling loop. Under `Danger` the oldest active task is
    /// cancelled and the shutdown signal fires.
    pub fn spawn(
        self: &Arc<Self>,
        processor: Arc<TaskProcessor>,
        shutdown: watch::Sender<bool>,
    ) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        let interval = self.thresholds.health_check_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let sample = monitor.sample();
                match monitor.level(sample) {
                    ResourceLevel::Normal => {}
                    ResourceLevel::Warn => {
                        tracing::warn!(
                            memory_pct = sample.memory_pct,
                            cpu_pct = sample.cpu_pct,
                            "resource pressure rising"
                        );
                    }
                    ResourceLevel::Critical => {
                        tracing::error!(
                            memory_pct = sample.memory_pct,
                            cpu_pct = sample.cpu_pct,
                            "resource pressure critical, rejecting new tasks"
                        );
                    }
                    ResourceLevel::Danger => {
                        tracing::error!(
                            memory_pct = sample.memory_pct,
                            cpu_pct = sample.cpu_pct,
                            "resource pressure dangerous, shedding load and shutting down"
                        );
                        processor.cancel_lowest_priority("resource pressure");
                        let _ = shutdown.send(true);
                    }
                }
            }
        })
    }
}

fn classify(value: f64, hard_limit: f64) -> ResourceLevel {
    if value >= hard_limit + 10.0 {
        ResourceLevel::Danger
    } else if value >= hard_limit {
        ResourceLevel::Critical
    } else if value >= hard_limit * 0.8 {
        ResourceLevel::Warn
    } else {
        ResourceLevel::Normal
    }
}

impl std::fmt::Debug for ResourceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceMonitor")
            .field("thresholds", &self.thresholds)
            .field("last", &self.last())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> ResourceMonitor {
        ResourceMonitor::new(ResourceThresholds {
            max_memory_pct: 85.0,
            max_cpu_pct: 90.0,
            health_check_interval_ms: 15_000,
        })
    }

    #[test]
    fn test_level_classification() {
        let m = monitor();
        let level = |memory_pct, cpu_pct| m.level(ResourceSample { memory_pct, cpu_pct });

        assert_eq!(level(10.0, 10.0), ResourceLevel::Normal);
        assert_eq!(level(70.0, 10.0), ResourceLevel::Warn); // 80% of 85
        assert_eq!(level(85.0, 10.0), ResourceLevel::Critical);
        assert_eq!(level(96.0, 10.0), ResourceLevel::Danger);
        // worst dimension wins
        assert_eq!(level(10.0, 95.0), ResourceLevel::Critical);
    }

    #[test]
    fn test_admission_follows_cached_sample() {
        let m = monitor();
        assert!(m.can_accept_new_tasks());
        *m.last.lock() = ResourceSample {
            memory_pct: 99.0,
            cpu_pct: 10.0,
        };
        assert!(!m.can_accept_new_tasks());
    }

    #[test]
    fn test_sample_populates_cache() {
        let m = monitor();
        let sample = m.sample();
        assert!(sample.memory_pct >= 0.0);
        assert!((m.last().memory_pct - sample.memory_pct).abs() < f64::EPSILON);
    }
}
