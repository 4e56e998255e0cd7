//! Executor: runs submitted specs against the aggregate ledger.
//!
//! Every submission gets its own thread that walks the segment sequence in
//! order: increase the ledger by the segment, hold for its duration, decrease.
//! The hold waits on the submission's cancel channel, so cancelling wakes it
//! immediately. The in-flight segment is always released before the handle
//! resolves, whatever the outcome.

#![allow(missing_docs)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use crate::core::config::{Config, ExecutorConfig};
use crate::core::errors::{Result, SlgError};
use crate::engine::aggregate::{LoadAggregator, LoadSink};
use crate::engine::controller::{Controller, ControllerSnapshot};
use crate::load::resources::ResourceLoad;
use crate::load::sequencer::{SegmentSequence, segment_count, sequence_with_limits};
use crate::load::spec::LoadSpec;
use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle, SubmissionOutcome};
use crate::monitor::cpu_usage::ProcessCpuSampler;
use crate::platform::pal::detect_platform;

// ──────────────────── handle ────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ExecutionState {
    Pending,
    Running { segment: u64 },
    Cancelling,
    Completed,
    Failed,
}

impl ExecutionState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// How a submission ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Completed { segments: u64 },
    Cancelled { segments_completed: u64 },
}

/// Cancellable handle to one running submission.
#[derive(Debug)]
pub struct ExecutionHandle {
    id: u64,
    cancel_tx: Sender<()>,
    state: Arc<Mutex<ExecutionState>>,
    join: Option<JoinHandle<Result<ExecutionOutcome>>>,
}

impl ExecutionHandle {
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Request cancellation. Observed at the next hold or segment boundary.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.try_send(());
    }

    #[must_use]
    pub fn state(&self) -> ExecutionState {
        *self.state.lock()
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Block until the submission resolves.
    pub fn wait(mut self) -> Result<ExecutionOutcome> {
        let join = self.join.take().ok_or_else(|| SlgError::Runtime {
            details: format!("execution {} already joined", self.id),
        })?;
        join.join().unwrap_or_else(|_| {
            Err(SlgError::Runtime {
                details: format!("execution {} panicked", self.id),
            })
        })
    }
}

// ──────────────────── executor ────────────────────

#[derive(Debug, Default)]
struct Registry {
    cancels: HashMap<u64, Sender<()>>,
    closed: bool,
}

#[derive(Debug)]
struct ExecutorInner {
    ledger: LoadAggregator,
    config: ExecutorConfig,
    logger: ActivityLoggerHandle,
    next_id: AtomicU64,
    registry: Mutex<Registry>,
    drained: Condvar,
}

/// Schedules specs onto a ledger and, when built with [`Executor::start`],
/// onto a live controller.
#[derive(Debug)]
pub struct Executor {
    inner: Arc<ExecutorInner>,
    controller: Mutex<Option<Controller>>,
    started_at: Instant,
}

impl Executor {
    /// Executor driving real simulators on this host.
    pub fn start(config: &Config, logger: ActivityLoggerHandle) -> Result<Self> {
        let platform = detect_platform()?;
        let sampler = ProcessCpuSampler::new(Arc::clone(&platform))?;
        let controller = Controller::start(config, &platform, Box::new(sampler), logger.clone())?;
        logger.send(ActivityEvent::ExecutorStarted {
            version: env!("CARGO_PKG_VERSION").to_string(),
            config_hash: config.stable_hash()?,
            cpu_workers: config
                .controller
                .effective_cpu_workers(platform.cpu_count()),
        });
        Ok(Self::with_controller(controller, &config.executor, logger))
    }

    /// Executor whose ledger feeds an already running controller.
    #[must_use]
    pub fn with_controller(
        controller: Controller,
        config: &ExecutorConfig,
        logger: ActivityLoggerHandle,
    ) -> Self {
        let mut executor = Self::with_sink(controller.sink(), config, logger);
        executor.controller = Mutex::new(Some(controller));
        executor
    }

    /// Executor whose ledger pushes totals into `sink` and nothing else.
    #[must_use]
    pub fn with_sink(
        sink: Arc<dyn LoadSink>,
        config: &ExecutorConfig,
        logger: ActivityLoggerHandle,
    ) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                ledger: LoadAggregator::new(sink),
                config: config.clone(),
                logger,
                next_id: AtomicU64::new(1),
                registry: Mutex::new(Registry::default()),
                drained: Condvar::new(),
            }),
            controller: Mutex::new(None),
            started_at: Instant::now(),
        }
    }

    /// Current aggregate of all in-flight segments.
    #[must_use]
    pub fn aggregate(&self) -> ResourceLoad {
        self.inner.ledger.current()
    }

    #[must_use]
    pub fn controller_snapshot(&self) -> Option<ControllerSnapshot> {
        self.controller.lock().as_ref().map(Controller::snapshot)
    }

    /// Number of submissions still running.
    #[must_use]
    pub fn active(&self) -> usize {
        self.inner.registry.lock().cancels.len()
    }

    /// Validate and start `spec` on its own thread.
    pub fn execute_async(&self, spec: &LoadSpec) -> Result<ExecutionHandle> {
        let config = &self.inner.config;
        let segments = sequence_with_limits(spec, config.max_segments, config.max_depth)?;
        let total = segment_count(spec).unwrap_or(u64::MAX);

        let (cancel_tx, cancel_rx) = bounded(1);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut registry = self.inner.registry.lock();
            if registry.closed {
                return Err(SlgError::ExecutorShutdown);
            }
            registry.cancels.insert(id, cancel_tx.clone());
        }

        let state = Arc::new(Mutex::new(ExecutionState::Pending));
        let submission = Submission {
            inner: Arc::clone(&self.inner),
            id,
            cancel_rx,
            state: Arc::clone(&state),
        };
        self.inner.logger.send(ActivityEvent::SubmissionAccepted {
            execution_id: id,
            segments: total,
        });
        let spawned = thread::Builder::new()
            .name(format!("slg-exec-{id}"))
            .spawn(move || submission.run(segments));
        let join = match spawned {
            Ok(join) => join,
            Err(err) => {
                self.inner.deregister(id);
                return Err(SlgError::Runtime {
                    details: format!("failed to spawn execution {id}: {err}"),
                });
            }
        };
        Ok(ExecutionHandle {
            id,
            cancel_tx,
            state,
            join: Some(join),
        })
    }

    /// Alias of [`Executor::execute_async`].
    pub fn submit(&self, spec: &LoadSpec) -> Result<ExecutionHandle> {
        self.execute_async(spec)
    }

    /// Run `spec` to completion on the calling thread's behalf.
    pub fn execute(&self, spec: &LoadSpec) -> Result<ExecutionOutcome> {
        self.execute_async(spec)?.wait()
    }

    /// Cancel everything in flight, wait up to the configured timeout for the
    /// submissions to release their load, then stop the controller.
    pub fn shutdown(&self) {
        let first = {
            let mut registry = self.inner.registry.lock();
            let first = !registry.closed;
            registry.closed = true;
            for cancel in registry.cancels.values() {
                let _ = cancel.try_send(());
            }
            let deadline =
                Instant::now() + Duration::from_millis(self.inner.config.shutdown_timeout_ms);
            while !registry.cancels.is_empty() {
                if self
                    .inner
                    .drained
                    .wait_until(&mut registry, deadline)
                    .timed_out()
                {
                    eprintln!(
                        "[SLG-EXECUTOR] {} submissions still running at shutdown",
                        registry.cancels.len()
                    );
                    break;
                }
            }
            first
        };
        if let Some(controller) = self.controller.lock().take() {
            controller.shutdown();
        }
        if first {
            self.inner.logger.send(ActivityEvent::ExecutorStopped {
                reason: "shutdown".to_string(),
                uptime_secs: self.started_at.elapsed().as_secs(),
            });
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl ExecutorInner {
    fn deregister(&self, id: u64) {
        let mut registry = self.registry.lock();
        registry.cancels.remove(&id);
        self.drained.notify_all();
    }
}

// ──────────────────── submission ────────────────────

/// Decreases the ledger on drop unless released explicitly.
struct Admitted<'a> {
    ledger: &'a LoadAggregator,
    load: ResourceLoad,
    released: bool,
}

impl<'a> Admitted<'a> {
    fn increase(ledger: &'a LoadAggregator, load: ResourceLoad) -> Result<Self> {
        ledger.increase_by(&load)?;
        Ok(Self {
            ledger,
            load,
            released: false,
        })
    }

    fn release(mut self) -> Result<ResourceLoad> {
        self.released = true;
        self.ledger.decrease_by(&self.load)
    }
}

impl Drop for Admitted<'_> {
    fn drop(&mut self) {
        if !self.released {
            let _ = self.ledger.decrease_by(&self.load);
        }
    }
}

struct Submission {
    inner: Arc<ExecutorInner>,
    id: u64,
    cancel_rx: Receiver<()>,
    state: Arc<Mutex<ExecutionState>>,
}

impl Submission {
    fn run(self, segments: SegmentSequence) -> Result<ExecutionOutcome> {
        let started = Instant::now();
        let mut completed = 0u64;
        let result = self.drive(segments, &mut completed);

        let (outcome, state) = match &result {
            Ok(ExecutionOutcome::Completed { .. }) => {
                (SubmissionOutcome::Completed, ExecutionState::Completed)
            }
            Ok(ExecutionOutcome::Cancelled { .. }) => {
                (SubmissionOutcome::Cancelled, ExecutionState::Completed)
            }
            Err(_) => (SubmissionOutcome::Failed, ExecutionState::Failed),
        };
        *self.state.lock() = state;
        #[allow(clippy::cast_possible_truncation)]
        let duration_ms = started.elapsed().as_millis() as u64;
        self.inner.logger.send(ActivityEvent::SubmissionFinished {
            execution_id: self.id,
            outcome,
            segments_completed: completed,
            duration_ms,
        });
        self.inner.deregister(self.id);
        result
    }

    fn drive(&self, segments: SegmentSequence, completed: &mut u64) -> Result<ExecutionOutcome> {
        let ledger = &self.inner.ledger;
        for (index, segment) in (0u64..).zip(segments) {
            if self.cancel_requested() {
                *self.state.lock() = ExecutionState::Cancelling;
                return Ok(ExecutionOutcome::Cancelled {
                    segments_completed: *completed,
                });
            }
            *self.state.lock() = ExecutionState::Running { segment: index };

            let load = segment.load();
            let admitted = match Admitted::increase(ledger, load) {
                Ok(admitted) => admitted,
                Err(err) => {
                    if let SlgError::Admission {
                        dimension,
                        attempted,
                        limit,
                    } = err
                    {
                        self.inner.logger.send(ActivityEvent::AdmissionRejected {
                            execution_id: self.id,
                            index,
                            dimension,
                            attempted,
                            limit,
                        });
                    }
                    return Err(err);
                }
            };
            let hold = segment.hold_duration();
            #[allow(clippy::cast_possible_truncation)]
            let hold_ms = hold.as_millis() as u64;
            self.inner.logger.send(ActivityEvent::SegmentStarted {
                execution_id: self.id,
                index,
                load,
                hold_ms,
            });

            let cancelled = self.hold(hold);
            if cancelled {
                *self.state.lock() = ExecutionState::Cancelling;
            }
            if let Err(err) = admitted.release() {
                if let SlgError::Release {
                    dimension,
                    current,
                    delta,
                } = err
                {
                    eprintln!("[SLG-EXECUTOR] ledger release violation: {err}");
                    self.inner.logger.send(ActivityEvent::ReleaseViolation {
                        execution_id: self.id,
                        dimension,
                        current,
                        delta,
                    });
                }
                return Err(err);
            }
            self.inner.logger.send(ActivityEvent::SegmentFinished {
                execution_id: self.id,
                index,
            });
            if cancelled {
                return Ok(ExecutionOutcome::Cancelled {
                    segments_completed: *completed,
                });
            }
            *completed += 1;
        }
        Ok(ExecutionOutcome::Completed {
            segments: *completed,
        })
    }

    fn cancel_requested(&self) -> bool {
        match self.cancel_rx.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => true,
            Err(TryRecvError::Empty) => false,
        }
    }

    /// Sleep for `hold`; returns `true` if cancelled first.
    fn hold(&self, hold: Duration) -> bool {
        match self.cancel_rx.recv_timeout(hold) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => false,
        }
    }
}
