//! Controller: turns the aggregate target into running simulators.
//!
//! The aggregator pushes every new total into a target cell and wakes the
//! control loop. The loop applies memory and disk targets directly, sets all
//! CPU workers to the desired percentage, then on each interval samples real
//! process CPU usage and nudges individual workers until the feedback state
//! machine reports convergence. Memory and disk threads are supervised and
//! respawned within a budget.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use crate::core::config::Config;
use crate::core::errors::{Result, SlgError};
use crate::core::units::format_bytes;
use crate::engine::aggregate::LoadSink;
use crate::engine::health::{RespawnBudget, ThreadHeartbeat, ThreadStatus};
use crate::load::resources::ResourceLoad;
use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle};
use crate::monitor::cpu_usage::CpuUsageSource;
use crate::monitor::feedback::{ConvergenceState, FeedbackController, FeedbackDecision};
use crate::platform::pal::Platform;
use crate::simulator::cpu::CpuSimulatorPool;
use crate::simulator::disk::{self, DiskDirection, DiskSimulator};
use crate::simulator::memory::MemorySimulator;

// ──────────────────── target cell ────────────────────

#[derive(Debug, Default)]
struct Target {
    load: ResourceLoad,
    generation: u64,
}

#[derive(Debug, Default)]
struct ControllerShared {
    target: Mutex<Target>,
    wake: Condvar,
    stopping: AtomicBool,
    convergence: Mutex<ConvergenceState>,
    restarts: AtomicU32,
}

impl ControllerShared {
    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }
}

impl LoadSink for ControllerShared {
    fn push(&self, total: ResourceLoad) {
        let mut target = self.target.lock();
        if target.load != total {
            target.load = total;
            target.generation += 1;
            self.wake.notify_all();
        }
    }
}

// ──────────────────── supervised simulators ────────────────────

trait Supervised: Send {
    fn apply(&self, target: &ResourceLoad);
    fn is_finished(&self) -> bool;
    fn take_exit(&mut self) -> Option<Result<()>>;
}

impl Supervised for MemorySimulator {
    fn apply(&self, target: &ResourceLoad) {
        // A closed channel means the thread died; supervision handles it.
        let _ = self.set_target(target.memory_bytes);
    }

    fn is_finished(&self) -> bool {
        Self::is_finished(self)
    }

    fn take_exit(&mut self) -> Option<Result<()>> {
        Self::take_exit(self)
    }
}

impl Supervised for DiskSimulator {
    fn apply(&self, target: &ResourceLoad) {
        self.set_target(match self.direction() {
            DiskDirection::Input => target.disk_input_bps,
            DiskDirection::Output => target.disk_output_bps,
        });
    }

    fn is_finished(&self) -> bool {
        Self::is_finished(self)
    }

    fn take_exit(&mut self) -> Option<Result<()>> {
        Self::take_exit(self)
    }
}

type Spawner<S> = Box<dyn Fn() -> Result<S> + Send>;

struct Slot<S: Supervised> {
    name: &'static str,
    sim: Option<S>,
    spawn: Spawner<S>,
    budget: RespawnBudget,
}

impl<S: Supervised> Slot<S> {
    fn start(name: &'static str, spawn: Spawner<S>, budget: RespawnBudget) -> Result<Self> {
        let sim = spawn()?;
        Ok(Self {
            name,
            sim: Some(sim),
            spawn,
            budget,
        })
    }

    fn apply(&self, target: &ResourceLoad) {
        if let Some(sim) = &self.sim {
            sim.apply(target);
        }
    }

    /// Respawn a dead simulator if the budget allows. A simulator that was
    /// given up is revived once its old failures leave the window. Returns
    /// `true` on respawn.
    fn supervise(
        &mut self,
        target: &ResourceLoad,
        logger: &ActivityLoggerHandle,
        restarts: &AtomicU32,
    ) -> bool {
        let reason = match self.sim.as_ref().map(S::is_finished) {
            Some(false) => return false,
            Some(true) => {
                let reason = match self.sim.take().and_then(|mut sim| sim.take_exit()) {
                    Some(Ok(())) => "exited".to_string(),
                    Some(Err(err)) => err.to_string(),
                    None => "unknown".to_string(),
                };
                if !self.budget.record_failure() {
                    eprintln!("[SLG-CONTROLLER] {} simulator exceeded respawn limit: {reason}", self.name);
                    logger.send(ActivityEvent::SimulatorFailed {
                        simulator: self.name.to_string(),
                        reason,
                    });
                    return false;
                }
                reason
            }
            None if self.budget.has_capacity() => "respawn window elapsed".to_string(),
            None => return false,
        };
        match (self.spawn)() {
            Ok(sim) => {
                sim.apply(target);
                self.sim = Some(sim);
                restarts.fetch_add(1, Ordering::Relaxed);
                eprintln!("[SLG-CONTROLLER] respawned {} simulator: {reason}", self.name);
                logger.send(ActivityEvent::SimulatorRestarted {
                    simulator: self.name.to_string(),
                    restarts: self.budget.total(),
                    reason,
                });
                true
            }
            Err(err) => {
                // A failed spawn is a failure too.
                let _ = self.budget.record_failure();
                logger.send(ActivityEvent::SimulatorFailed {
                    simulator: self.name.to_string(),
                    reason: format!("respawn failed: {err}"),
                });
                false
            }
        }
    }

    fn shutdown(&mut self) {
        // Dropping joins the thread.
        self.sim = None;
    }
}

struct Simulators {
    cpu: CpuSimulatorPool,
    memory: Slot<MemorySimulator>,
    disk_input: Slot<DiskSimulator>,
    disk_output: Slot<DiskSimulator>,
}

impl Simulators {
    fn start(config: &Config, cpu_workers: usize) -> Result<Self> {
        let window = Duration::from_millis(config.cpu.window_ms);
        let budget = RespawnBudget::new(
            config.controller.respawn_limit,
            config.controller.respawn_window(),
        );

        let memory_config = config.memory.clone();
        let memory = Slot::start(
            "memory",
            Box::new(move || MemorySimulator::spawn(&memory_config)),
            budget.clone(),
        )?;
        let input_config = config.disk.clone();
        let disk_input = Slot::start(
            DiskDirection::Input.simulator_name(),
            Box::new(move || {
                DiskSimulator::spawn(
                    DiskDirection::Input,
                    input_config.io_chunk_bytes,
                    disk::file_input(&input_config),
                )
            }),
            budget.clone(),
        )?;
        let output_config = config.disk.clone();
        let disk_output = Slot::start(
            DiskDirection::Output.simulator_name(),
            Box::new(move || {
                DiskSimulator::spawn(
                    DiskDirection::Output,
                    output_config.io_chunk_bytes,
                    disk::file_output(&output_config),
                )
            }),
            budget,
        )?;
        Ok(Self {
            cpu: CpuSimulatorPool::start(cpu_workers, window)?,
            memory,
            disk_input,
            disk_output,
        })
    }

    fn apply(&self, target: &ResourceLoad) {
        self.memory.apply(target);
        self.disk_input.apply(target);
        self.disk_output.apply(target);
    }

    fn supervise(&mut self, target: &ResourceLoad, logger: &ActivityLoggerHandle, restarts: &AtomicU32) {
        self.memory.supervise(target, logger, restarts);
        self.disk_input.supervise(target, logger, restarts);
        self.disk_output.supervise(target, logger, restarts);
    }

    fn shutdown(&mut self) {
        self.cpu.shutdown();
        self.memory.shutdown();
        self.disk_input.shutdown();
        self.disk_output.shutdown();
    }
}

// ──────────────────── controller ────────────────────

/// Point-in-time view of the controller, for status output and tests.
#[derive(Debug, Clone, Serialize)]
pub struct ControllerSnapshot {
    pub target: ResourceLoad,
    pub setpoints: Vec<u32>,
    pub convergence: ConvergenceState,
    pub memory_allocated: u64,
    pub disk_read_bytes: u64,
    pub disk_written_bytes: u64,
    /// Resident set size of this process as the host reports it.
    pub process_rss_bytes: Option<u64>,
    pub restarts: u32,
    pub loop_status: ThreadStatus,
}

pub struct Controller {
    shared: Arc<ControllerShared>,
    sims: Arc<Mutex<Simulators>>,
    platform: Arc<dyn Platform>,
    heartbeat: Arc<ThreadHeartbeat>,
    interval: Duration,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Spawn the simulators and the control loop.
    pub fn start(
        config: &Config,
        platform: &Arc<dyn Platform>,
        cpu_source: Box<dyn CpuUsageSource>,
        logger: ActivityLoggerHandle,
    ) -> Result<Self> {
        let cpu_workers = config
            .controller
            .effective_cpu_workers(platform.cpu_count());
        if matches!(platform.is_ram_backed(&config.disk.directory), Ok(true)) {
            eprintln!(
                "[SLG-CONTROLLER] {} is RAM-backed; disk simulation will not reach a device",
                config.disk.directory.display()
            );
        }

        let sims = Arc::new(Mutex::new(Simulators::start(config, cpu_workers)?));
        let shared = Arc::new(ControllerShared::default());
        let heartbeat = ThreadHeartbeat::new("slg-controller");
        let interval = config.controller.interval();

        let control = ControlLoop {
            shared: Arc::clone(&shared),
            sims: Arc::clone(&sims),
            heartbeat: Arc::clone(&heartbeat),
            platform: Arc::clone(platform),
            feedback: FeedbackController::new(config.controller.threshold_pct, cpu_workers),
            cpu_source,
            logger,
            interval,
            applied_generation: 0,
            applied_memory: 0,
            nudge_offset: 0,
        };
        let join = thread::Builder::new()
            .name("slg-controller".to_string())
            .spawn(move || control.run())
            .map_err(|err| SlgError::Runtime {
                details: format!("failed to spawn controller thread: {err}"),
            })?;

        Ok(Self {
            shared,
            sims,
            platform: Arc::clone(platform),
            heartbeat,
            interval,
            join: Mutex::new(Some(join)),
        })
    }

    /// The sink an aggregator should push its totals into.
    #[must_use]
    pub fn sink(&self) -> Arc<dyn LoadSink> {
        Arc::clone(&self.shared) as Arc<dyn LoadSink>
    }

    #[must_use]
    pub fn target(&self) -> ResourceLoad {
        self.shared.target.lock().load
    }

    #[must_use]
    pub fn snapshot(&self) -> ControllerSnapshot {
        let target = self.target();
        let convergence = *self.shared.convergence.lock();
        let sims = self.sims.lock();
        ControllerSnapshot {
            target,
            setpoints: sims.cpu.setpoints(),
            convergence,
            memory_allocated: sims
                .memory
                .sim
                .as_ref()
                .map_or(0, MemorySimulator::allocated_bytes),
            disk_read_bytes: sims
                .disk_input
                .sim
                .as_ref()
                .map_or(0, DiskSimulator::bytes_moved),
            disk_written_bytes: sims
                .disk_output
                .sim
                .as_ref()
                .map_or(0, DiskSimulator::bytes_moved),
            process_rss_bytes: self.platform.process_rss_bytes().ok(),
            restarts: self.shared.restarts.load(Ordering::Relaxed),
            loop_status: self.heartbeat.status(self.interval * 3),
        }
    }

    /// Stop the loop and every simulator. Idempotent.
    pub fn shutdown(&self) {
        {
            let _target = self.shared.target.lock();
            self.shared.stopping.store(true, Ordering::Release);
        }
        self.shared.wake.notify_all();
        if let Some(join) = self.join.lock().take() {
            let _ = join.join();
        }
        self.sims.lock().shutdown();
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct ControlLoop {
    shared: Arc<ControllerShared>,
    sims: Arc<Mutex<Simulators>>,
    heartbeat: Arc<ThreadHeartbeat>,
    platform: Arc<dyn Platform>,
    feedback: FeedbackController,
    cpu_source: Box<dyn CpuUsageSource>,
    logger: ActivityLoggerHandle,
    interval: Duration,
    applied_generation: u64,
    applied_memory: u64,
    nudge_offset: usize,
}

impl ControlLoop {
    fn run(mut self) {
        while let Some((target, generation)) = self.wait_for_work() {
            self.heartbeat.beat();
            let retargeted = generation != self.applied_generation;
            if retargeted {
                self.retarget(&target, generation);
            } else if target.cpu > 0 {
                self.correct_cpu();
            }
            let mut sims = self.sims.lock();
            sims.supervise(&target, &self.logger, &self.shared.restarts);
        }
    }

    /// Block until the target changes or an interval passes. With nothing to
    /// simulate the loop parks until the next target arrives.
    fn wait_for_work(&self) -> Option<(ResourceLoad, u64)> {
        let mut target = self.shared.target.lock();
        if !self.shared.is_stopping() && target.generation == self.applied_generation {
            if target.load.is_zero() {
                self.heartbeat.park();
                while target.generation == self.applied_generation && !self.shared.is_stopping() {
                    self.shared.wake.wait(&mut target);
                }
            } else {
                self.shared.wake.wait_for(&mut target, self.interval);
            }
        }
        if self.shared.is_stopping() {
            return None;
        }
        Some((target.load, target.generation))
    }

    fn retarget(&mut self, target: &ResourceLoad, generation: u64) {
        self.applied_generation = generation;
        self.logger.send(ActivityEvent::TargetChanged { target: *target });
        {
            let sims = self.sims.lock();
            if target.memory_bytes != self.applied_memory {
                self.applied_memory = target.memory_bytes;
                let held = sims
                    .memory
                    .sim
                    .as_ref()
                    .map_or(0, MemorySimulator::allocated_bytes);
                self.check_memory_headroom(target.memory_bytes, held);
            }
            sims.apply(target);
            sims.cpu.set_all(u32::try_from(target.cpu).unwrap_or(u32::MAX));
        }
        self.feedback.retarget(target.cpu);
        // Restart the measurement window at the new setpoints.
        if let Err(err) = self.cpu_source.sample_process_cpu_percent() {
            eprintln!("[SLG-CONTROLLER] cpu sample failed: {err}");
        }
        *self.shared.convergence.lock() = self.feedback.state();
    }

    /// Warn when the memory target cannot fit in what the host has free,
    /// counting memory this process already holds for the old target.
    fn check_memory_headroom(&self, target_bytes: u64, held_bytes: u64) {
        if target_bytes == 0 {
            return;
        }
        match self.platform.memory_info() {
            Ok(info) => {
                let available_bytes = info.available_bytes.saturating_add(held_bytes);
                if target_bytes > available_bytes {
                    eprintln!(
                        "[SLG-CONTROLLER] memory target {} exceeds available {}",
                        format_bytes(target_bytes),
                        format_bytes(available_bytes)
                    );
                    self.logger.send(ActivityEvent::MemoryPressure {
                        target_bytes,
                        available_bytes,
                    });
                }
            }
            Err(err) => eprintln!("[SLG-CONTROLLER] memory probe failed: {err}"),
        }
    }

    fn correct_cpu(&mut self) {
        let actual = match self.cpu_source.sample_process_cpu_percent() {
            Ok(actual) => actual,
            Err(err) => {
                eprintln!("[SLG-CONTROLLER] cpu sample failed: {err}");
                self.logger.send(ActivityEvent::Error {
                    code: err.code().to_string(),
                    message: err.to_string(),
                });
                return;
            }
        };
        let decision = self.feedback.observe(actual);
        *self.shared.convergence.lock() = self.feedback.state();
        if let FeedbackDecision::Nudge {
            direction,
            simulators,
        } = decision
        {
            let sims = self.sims.lock();
            sims.cpu.nudge(direction, simulators, self.nudge_offset);
            self.nudge_offset = (self.nudge_offset + simulators) % sims.cpu.len().max(1);
            self.logger.send(ActivityEvent::ControllerAdjusted {
                desired_cpu: self.feedback.desired(),
                actual_cpu: actual,
                nudged: simulators,
                direction: direction.delta(),
            });
        }
    }
}
