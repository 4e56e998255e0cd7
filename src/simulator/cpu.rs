//! CPU busy-loop workers, one per core.
//!
//! Each worker spends `setpoint` percent of every window computing and sleeps
//! the rest. At setpoint zero it parks on a condvar until woken.

#![allow(missing_docs)]

use std::hint::black_box;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::core::errors::{Result, SlgError};
use crate::monitor::feedback::Direction;

const MAX_SETPOINT: u32 = 100;

/// Shared state of one CPU worker thread.
#[derive(Debug)]
pub struct CpuWorker {
    setpoint: AtomicU32,
    park: Mutex<()>,
    wake: Condvar,
    stopping: AtomicBool,
}

impl CpuWorker {
    fn new() -> Self {
        Self {
            setpoint: AtomicU32::new(0),
            park: Mutex::new(()),
            wake: Condvar::new(),
            stopping: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn setpoint(&self) -> u32 {
        self.setpoint.load(Ordering::Acquire)
    }

    pub fn set(&self, pct: u32) {
        self.setpoint.store(pct.min(MAX_SETPOINT), Ordering::Release);
        self.notify();
    }

    /// Move the setpoint one unit in `direction`, saturating at 0 and 100.
    pub fn adjust(&self, direction: Direction) -> u32 {
        let mut current = self.setpoint.load(Ordering::Acquire);
        loop {
            let next = match direction {
                Direction::Up => (current + 1).min(MAX_SETPOINT),
                Direction::Down => current.saturating_sub(1),
            };
            match self.setpoint.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if current == 0 && next > 0 {
                        self.notify();
                    }
                    return next;
                }
                Err(observed) => current = observed,
            }
        }
    }

    fn notify(&self) {
        // Taking the lock orders this wakeup after a parked worker's check.
        drop(self.park.lock());
        self.wake.notify_one();
    }

    fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        self.notify();
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    fn run(&self, window: Duration) {
        while !self.is_stopping() {
            let pct = {
                let mut guard = self.park.lock();
                while self.setpoint() == 0 && !self.is_stopping() {
                    self.wake.wait(&mut guard);
                }
                self.setpoint()
            };
            if self.is_stopping() {
                break;
            }
            let busy = window.mul_f64(f64::from(pct) / 100.0);
            let started = Instant::now();
            spin_for(busy);
            if let Some(rest) = window.checked_sub(started.elapsed()) {
                thread::sleep(rest);
            }
        }
    }
}

/// Burn CPU with a recurrence the optimizer cannot fold away.
fn spin_for(busy: Duration) {
    let started = Instant::now();
    let mut x: u64 = 0x9E37_79B9_7F4A_7C15;
    while started.elapsed() < busy {
        for _ in 0..512 {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            x = black_box(x);
        }
    }
}

/// The full set of CPU workers.
#[derive(Debug)]
pub struct CpuSimulatorPool {
    workers: Vec<Arc<CpuWorker>>,
    joins: Vec<JoinHandle<()>>,
}

impl CpuSimulatorPool {
    pub fn start(count: usize, window: Duration) -> Result<Self> {
        let mut pool = Self {
            workers: Vec::with_capacity(count),
            joins: Vec::with_capacity(count),
        };
        for index in 0..count.max(1) {
            let worker = Arc::new(CpuWorker::new());
            let shared = Arc::clone(&worker);
            let join = thread::Builder::new()
                .name(format!("slg-cpu-{index}"))
                .spawn(move || shared.run(window))
                .map_err(|err| SlgError::Runtime {
                    details: format!("failed to spawn cpu worker {index}: {err}"),
                })?;
            pool.workers.push(worker);
            pool.joins.push(join);
        }
        Ok(pool)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn set_all(&self, pct: u32) {
        for worker in &self.workers {
            worker.set(pct);
        }
    }

    /// Nudge `count` workers one unit, starting at `offset` and wrapping, so
    /// repeated small corrections spread over the pool.
    pub fn nudge(&self, direction: Direction, count: usize, offset: usize) {
        let len = self.workers.len();
        if len == 0 {
            return;
        }
        for i in 0..count.min(len) {
            self.workers[(offset + i) % len].adjust(direction);
        }
    }

    #[must_use]
    pub fn setpoints(&self) -> Vec<u32> {
        self.workers.iter().map(|worker| worker.setpoint()).collect()
    }

    /// Stop and join every worker.
    pub fn shutdown(&mut self) {
        for worker in &self.workers {
            worker.stop();
        }
        for join in self.joins.drain(..) {
            let _ = join.join();
        }
    }
}

impl Drop for CpuSimulatorPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
