// Adaptive scheduler
//
// Recommends how many videos the intake driver should scan concurrently,
// from live CPU/memory readings. It never issues work itself: the driver
// asks before each batch. The probe is a trait so tests inject fixed
// readings; the real one averages sysinfo's per-core values.

use sysinfo::System;

use crate::config::ProcessingConfig;
use crate::constants::TIMEOUT_WARNING_RATIO;
use crate::error::Result;

/// One representative CPU% / memory% reading.
pub trait LoadProbe: Send {
    fn cpu_percent(&mut self) -> f64;
    fn memory_percent(&mut self) -> f64;
}

pub struct SysinfoProbe {
    sys: System,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let mut sys = System::new();
        // Prime the counters; the first delta-based CPU reading needs a
        // baseline refresh.
        sys.refresh_cpu();
        sys.refresh_memory();
        Self { sys }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadProbe for SysinfoProbe {
    fn cpu_percent(&mut self) -> f64 {
        self.sys.refresh_cpu();
        let cpus = self.sys.cpus();
        if cpus.is_empty() {
            return 0.0;
        }
        cpus.iter().map(|cpu| cpu.cpu_usage() as f64).sum::<f64>() / cpus.len() as f64
    }

    fn memory_percent(&mut self) -> f64 {
        self.sys.refresh_memory();
        let total = self.sys.total_memory();
        if total == 0 {
            return 0.0;
        }
        (self.sys.used_memory() as f64 / total as f64) * 100.0
    }
}

pub struct AdaptiveScheduler {
    min_batch: u32,
    max_batch: u32,
    cpu_low: f64,
    cpu_high: f64,
    memory_threshold: f64,
    probe: Box<dyn LoadProbe>,
}

impl AdaptiveScheduler {
    /// Build from validated configuration. Re-validates so a scheduler can
    /// never be constructed around unsafe thresholds.
    pub fn new(config: &ProcessingConfig, probe: Box<dyn LoadProbe>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            min_batch: config.batch_size_min,
            max_batch: config.batch_size_max,
            cpu_low: config.cpu_threshold_low,
            cpu_high: config.cpu_threshold_high,
            memory_threshold: config.memory_threshold,
            probe,
        })
    }

    /// Recommend the next batch size given the current one.
    ///
    /// Both readings below the low threshold: grow by one. Either above its
    /// high threshold: shrink by one. Otherwise hold. Always within
    /// [min_batch, max_batch].
    pub fn recommend(&mut self, current: u32) -> u32 {
        let cpu = self.probe.cpu_percent();
        let memory = self.probe.memory_percent();
        let current = current.clamp(self.min_batch, self.max_batch);

        let next = if cpu < self.cpu_low && memory < self.cpu_low {
            (current + 1).min(self.max_batch)
        } else if cpu > self.cpu_high || memory > self.memory_threshold {
            current.saturating_sub(1).max(self.min_batch)
        } else {
            current
        };

        if next != current {
            log::info!(
                "batch size {} -> {} (cpu {:.0}%, mem {:.0}%)",
                current, next, cpu, memory
            );
        }
        next
    }

    /// Passive observability check: warn when more than 10% of the files in
    /// a recent window timed out. Never changes the batch size.
    pub fn check_timeout_warning(&self, timed_out: usize, total: usize) -> bool {
        if total == 0 {
            return false;
        }
        let ratio = timed_out as f64 / total as f64;
        if ratio > TIMEOUT_WARNING_RATIO {
            log::warn!(
                "{} of {} files timed out ({:.0}%); scan throughput degraded",
                timed_out,
                total,
                ratio * 100.0
            );
            return true;
        }
        false
    }
}
