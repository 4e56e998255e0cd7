//! Activity logger thread and the handle every other component logs through.
//!
//! A dedicated thread owns the [`JsonlWriter`]. Executors, the controller and
//! simulators send [`ActivityEvent`]s over a bounded crossbeam channel with
//! `try_send`, so a slow disk never stalls a segment or a busy loop. Events
//! that do not fit are counted and reported as one warning line later.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

use crate::core::config::LoggingConfig;
use crate::core::errors::{Dimension, Result, SlgError};
use crate::load::resources::ResourceLoad;
use crate::logger::jsonl::{EventType, JsonlConfig, JsonlWriter, LogEntry, Severity};

const CHANNEL_CAPACITY: usize = 2048;

/// How a submission ended, as recorded in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionOutcome {
    Completed,
    Cancelled,
    Failed,
}

impl SubmissionOutcome {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub enum ActivityEvent {
    ExecutorStarted {
        version: String,
        config_hash: String,
        cpu_workers: usize,
    },
    ExecutorStopped {
        reason: String,
        uptime_secs: u64,
    },
    SubmissionAccepted {
        execution_id: u64,
        segments: u64,
    },
    SegmentStarted {
        execution_id: u64,
        index: u64,
        load: ResourceLoad,
        hold_ms: u64,
    },
    SegmentFinished {
        execution_id: u64,
        index: u64,
    },
    AdmissionRejected {
        execution_id: u64,
        index: u64,
        dimension: Dimension,
        attempted: u64,
        limit: u64,
    },
    SubmissionFinished {
        execution_id: u64,
        outcome: SubmissionOutcome,
        segments_completed: u64,
        duration_ms: u64,
    },
    ReleaseViolation {
        execution_id: u64,
        dimension: Dimension,
        current: u64,
        delta: u64,
    },
    TargetChanged {
        target: ResourceLoad,
    },
    ControllerAdjusted {
        desired_cpu: u64,
        actual_cpu: f64,
        nudged: usize,
        direction: i8,
    },
    SimulatorRestarted {
        simulator: String,
        restarts: u32,
        reason: String,
    },
    SimulatorFailed {
        simulator: String,
        reason: String,
    },
    /// Memory target larger than what the host reports as available.
    MemoryPressure {
        target_bytes: u64,
        available_bytes: u64,
    },
    Error {
        code: String,
        message: String,
    },
    /// Stops the logger thread after flushing.
    Shutdown,
}

/// Cloneable, non-blocking sender side of the activity log.
#[derive(Clone)]
pub struct ActivityLoggerHandle {
    tx: Sender<ActivityEvent>,
    dropped_events: Arc<AtomicU64>,
}

impl std::fmt::Debug for ActivityLoggerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityLoggerHandle")
            .field("dropped_events", &self.dropped_events())
            .finish_non_exhaustive()
    }
}

impl ActivityLoggerHandle {
    /// A handle whose events go nowhere.
    #[must_use]
    pub fn disabled() -> Self {
        let (tx, _rx) = bounded(1);
        Self {
            tx,
            dropped_events: Arc::new(AtomicU64::new(0)),
        }
    }

    /// A handle paired with its raw receiver, for callers that consume events
    /// themselves instead of writing them to disk.
    #[must_use]
    pub fn detached(capacity: usize) -> (Self, Receiver<ActivityEvent>) {
        let (tx, rx) = bounded(capacity);
        (
            Self {
                tx,
                dropped_events: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Queue an event without blocking. A full channel drops the event.
    pub fn send(&self, event: ActivityEvent) {
        if let Err(TrySendError::Full(_)) = self.tx.try_send(event) {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Ask the logger thread to flush and exit.
    pub fn shutdown(&self) {
        let _ = self.tx.send(ActivityEvent::Shutdown);
    }
}

/// Start the logger thread, or hand back a disabled handle when logging is off.
pub fn spawn_logger(
    logging: &LoggingConfig,
) -> Result<(ActivityLoggerHandle, Option<thread::JoinHandle<()>>)> {
    if !logging.enabled {
        return Ok((ActivityLoggerHandle::disabled(), None));
    }
    let (handle, rx) = ActivityLoggerHandle::detached(CHANNEL_CAPACITY);
    let dropped = Arc::clone(&handle.dropped_events);
    let jsonl_config = JsonlConfig::from(logging);
    let join = thread::Builder::new()
        .name("slg-logger".to_string())
        .spawn(move || run_logger(&rx, jsonl_config, &dropped))
        .map_err(|err| SlgError::Runtime {
            details: format!("failed to spawn logger thread: {err}"),
        })?;
    Ok((handle, Some(join)))
}

fn run_logger(rx: &Receiver<ActivityEvent>, config: JsonlConfig, dropped: &AtomicU64) {
    let mut writer = JsonlWriter::open(config);
    while let Ok(event) = rx.recv() {
        let lost = dropped.swap(0, Ordering::Relaxed);
        if lost > 0 {
            let mut warning = LogEntry::new(EventType::Error, Severity::Warning);
            warning.fields.details = Some(format!("{lost} activity events dropped"));
            writer.write_entry(&warning);
        }
        if matches!(event, ActivityEvent::Shutdown) {
            break;
        }
        if let Some(entry) = to_log_entry(&event) {
            writer.write_entry(&entry);
        }
    }
    writer.sync();
}

fn with_load(entry: &mut LogEntry, load: &ResourceLoad) {
    entry.fields.cpu = Some(load.cpu);
    entry.fields.memory_bytes = Some(load.memory_bytes);
    entry.fields.disk_input_bps = Some(load.disk_input_bps);
    entry.fields.disk_output_bps = Some(load.disk_output_bps);
}

/// Map an event to its log line. `Shutdown` has none.
#[allow(clippy::too_many_lines)]
#[must_use]
pub fn to_log_entry(event: &ActivityEvent) -> Option<LogEntry> {
    let entry = match event {
        ActivityEvent::ExecutorStarted {
            version,
            config_hash,
            cpu_workers,
        } => {
            let mut e = LogEntry::new(EventType::ExecutorStart, Severity::Info);
            e.fields.details = Some(format!(
                "version={version} config_hash={config_hash} cpu_workers={cpu_workers}"
            ));
            e
        }
        ActivityEvent::ExecutorStopped {
            reason,
            uptime_secs,
        } => {
            let mut e = LogEntry::new(EventType::ExecutorStop, Severity::Info);
            e.fields.details = Some(format!("reason={reason} uptime={uptime_secs}s"));
            e
        }
        ActivityEvent::SubmissionAccepted {
            execution_id,
            segments,
        } => {
            let mut e = LogEntry::new(EventType::SubmissionAccepted, Severity::Info);
            e.fields.execution_id = Some(*execution_id);
            e.fields.details = Some(format!("segments={segments}"));
            e
        }
        ActivityEvent::SegmentStarted {
            execution_id,
            index,
            load,
            hold_ms,
        } => {
            let mut e = LogEntry::new(EventType::SegmentStart, Severity::Info);
            e.fields.execution_id = Some(*execution_id);
            e.fields.segment_index = Some(*index);
            e.fields.duration_ms = Some(*hold_ms);
            with_load(&mut e, load);
            e
        }
        ActivityEvent::SegmentFinished {
            execution_id,
            index,
        } => {
            let mut e = LogEntry::new(EventType::SegmentFinish, Severity::Info);
            e.fields.execution_id = Some(*execution_id);
            e.fields.segment_index = Some(*index);
            e
        }
        ActivityEvent::AdmissionRejected {
            execution_id,
            index,
            dimension,
            attempted,
            limit,
        } => {
            let mut e = LogEntry::new(EventType::AdmissionRejected, Severity::Warning);
            e.fields.execution_id = Some(*execution_id);
            e.fields.segment_index = Some(*index);
            e.fields.dimension = Some(dimension.to_string());
            e.fields.attempted = Some(*attempted);
            e.fields.limit = Some(*limit);
            e
        }
        ActivityEvent::SubmissionFinished {
            execution_id,
            outcome,
            segments_completed,
            duration_ms,
        } => {
            let severity = match outcome {
                SubmissionOutcome::Failed => Severity::Warning,
                SubmissionOutcome::Completed | SubmissionOutcome::Cancelled => Severity::Info,
            };
            let mut e = LogEntry::new(EventType::SubmissionFinish, severity);
            e.fields.execution_id = Some(*execution_id);
            e.fields.outcome = Some(outcome.as_str().to_string());
            e.fields.segment_index = Some(*segments_completed);
            e.fields.duration_ms = Some(*duration_ms);
            e
        }
        ActivityEvent::ReleaseViolation {
            execution_id,
            dimension,
            current,
            delta,
        } => {
            let mut e = LogEntry::new(EventType::ReleaseViolation, Severity::Critical);
            e.fields.execution_id = Some(*execution_id);
            e.fields.dimension = Some(dimension.to_string());
            e.fields.details = Some(format!("current={current} delta={delta}"));
            e
        }
        ActivityEvent::TargetChanged { target } => {
            let mut e = LogEntry::new(EventType::TargetChange, Severity::Info);
            with_load(&mut e, target);
            e
        }
        ActivityEvent::ControllerAdjusted {
            desired_cpu,
            actual_cpu,
            nudged,
            direction,
        } => {
            let mut e = LogEntry::new(EventType::ControllerAdjust, Severity::Info);
            e.fields.cpu = Some(*desired_cpu);
            e.fields.actual_cpu = Some(*actual_cpu);
            e.fields.details = Some(format!("nudged={nudged} direction={direction:+}"));
            e
        }
        ActivityEvent::SimulatorRestarted {
            simulator,
            restarts,
            reason,
        } => {
            let mut e = LogEntry::new(EventType::SimulatorRestart, Severity::Warning);
            e.fields.simulator = Some(simulator.clone());
            e.fields.details = Some(format!("restarts={restarts} reason={reason}"));
            e
        }
        ActivityEvent::SimulatorFailed { simulator, reason } => {
            let mut e = LogEntry::new(EventType::SimulatorFailure, Severity::Critical);
            e.fields.simulator = Some(simulator.clone());
            e.fields.error_message = Some(reason.clone());
            e
        }
        ActivityEvent::MemoryPressure {
            target_bytes,
            available_bytes,
        } => {
            let mut e = LogEntry::new(EventType::MemoryPressure, Severity::Warning);
            e.fields.memory_bytes = Some(*target_bytes);
            e.fields.limit = Some(*available_bytes);
            e.fields.simulator = Some("memory".to_string());
            e
        }
        ActivityEvent::Error { code, message } => {
            let mut e = LogEntry::new(EventType::Error, Severity::Critical);
            e.fields.error_code = Some(code.clone());
            e.fields.error_message = Some(message.clone());
            e
        }
        ActivityEvent::Shutdown => return None,
    };
    Some(entry)
}
