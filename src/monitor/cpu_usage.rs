//! Process CPU usage sampling.

#![allow(missing_docs)]
#![allow(clippy::cast_precision_loss)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::core::errors::Result;
use crate::platform::pal::Platform;

/// Source of "how busy is this process right now" readings.
pub trait CpuUsageSource: Send {
    /// Percent of the whole machine (all cores) used by this process since the
    /// previous call.
    fn sample_process_cpu_percent(&mut self) -> Result<f64>;
}

/// Derives usage from the process CPU clock: `Δcpu / Δwall / cores`.
pub struct ProcessCpuSampler {
    platform: Arc<dyn Platform>,
    cores: usize,
    last_wall: Instant,
    last_cpu: Duration,
}

impl ProcessCpuSampler {
    pub fn new(platform: Arc<dyn Platform>) -> Result<Self> {
        let last_cpu = platform.process_cpu_time()?;
        let cores = platform.cpu_count().max(1);
        Ok(Self {
            platform,
            cores,
            last_wall: Instant::now(),
            last_cpu,
        })
    }
}

impl CpuUsageSource for ProcessCpuSampler {
    fn sample_process_cpu_percent(&mut self) -> Result<f64> {
        let now = Instant::now();
        let cpu = self.platform.process_cpu_time()?;
        let wall = now.duration_since(self.last_wall);
        let used = cpu.saturating_sub(self.last_cpu);
        self.last_wall = now;
        self.last_cpu = cpu;
        Ok(usage_percent(used, wall, self.cores))
    }
}

fn usage_percent(used: Duration, wall: Duration, cores: usize) -> f64 {
    if wall.is_zero() {
        return 0.0;
    }
    let pct = used.as_secs_f64() / wall.as_secs_f64() / cores as f64 * 100.0;
    pct.clamp(0.0, 100.0)
}

/// Replays queued readings; once the queue is empty the last one repeats.
#[derive(Debug, Clone, Default)]
pub struct ScriptedCpuSource {
    queue: Arc<Mutex<VecDeque<f64>>>,
    last: Arc<Mutex<f64>>,
}

impl ScriptedCpuSource {
    #[must_use]
    pub fn new(readings: impl IntoIterator<Item = f64>) -> Self {
        Self {
            queue: Arc::new(Mutex::new(readings.into_iter().collect())),
            last: Arc::new(Mutex::new(0.0)),
        }
    }

    pub fn push(&self, reading: f64) {
        self.queue.lock().push_back(reading);
    }
}

impl CpuUsageSource for ScriptedCpuSource {
    fn sample_process_cpu_percent(&mut self) -> Result<f64> {
        let mut last = self.last.lock();
        if let Some(next) = self.queue.lock().pop_front() {
            *last = next;
        }
        Ok(*last)
    }
}
