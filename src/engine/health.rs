//! Liveness tracking for long-lived threads.

#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use serde::Serialize;

// ──────────────────── heartbeat ────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ThreadStatus {
    Running { name: String, idle_ms: u64 },
    /// Blocked on purpose until there is work.
    Parked { name: String },
    Stalled { name: String, idle_ms: u64 },
}

impl ThreadStatus {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Running { name, .. } | Self::Parked { name } | Self::Stalled { name, .. } => name,
        }
    }

    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        !matches!(self, Self::Stalled { .. })
    }
}

/// Last-seen timestamp written by a worker loop and read by observers.
#[derive(Debug)]
pub struct ThreadHeartbeat {
    last_beat_ms: AtomicU64,
    parked: AtomicBool,
    name: String,
}

impl ThreadHeartbeat {
    #[must_use]
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            last_beat_ms: AtomicU64::new(monotonic_ms()),
            parked: AtomicBool::new(false),
            name: name.to_string(),
        })
    }

    pub fn beat(&self) {
        self.parked.store(false, Ordering::Relaxed);
        self.last_beat_ms.store(monotonic_ms(), Ordering::Relaxed);
    }

    /// Mark the thread as intentionally blocked; cleared by the next `beat`.
    pub fn park(&self) {
        self.beat();
        self.parked.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn status(&self, stall_threshold: Duration) -> ThreadStatus {
        let name = self.name.clone();
        if self.parked.load(Ordering::Relaxed) {
            return ThreadStatus::Parked { name };
        }
        let idle_ms = monotonic_ms().saturating_sub(self.last_beat_ms.load(Ordering::Relaxed));
        #[allow(clippy::cast_possible_truncation)]
        let threshold_ms = stall_threshold.as_millis() as u64;
        if idle_ms > threshold_ms {
            ThreadStatus::Stalled { name, idle_ms }
        } else {
            ThreadStatus::Running { name, idle_ms }
        }
    }
}

fn monotonic_ms() -> u64 {
    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    let origin = ORIGIN.get_or_init(Instant::now);
    #[allow(clippy::cast_possible_truncation)]
    let ms = origin.elapsed().as_millis() as u64;
    ms
}

// ──────────────────── respawn budget ────────────────────

/// Sliding-window restart allowance for one supervised simulator.
#[derive(Debug, Clone)]
pub struct RespawnBudget {
    limit: u32,
    window: Duration,
    failures: Vec<Instant>,
    total: u32,
}

impl RespawnBudget {
    #[must_use]
    pub const fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            failures: Vec::new(),
            total: 0,
        }
    }

    /// Record a failure. Returns `false` once more than `limit` failures fall
    /// inside the window.
    pub fn record_failure(&mut self) -> bool {
        self.record_failure_at(Instant::now())
    }

    fn record_failure_at(&mut self, now: Instant) -> bool {
        self.prune(now);
        self.failures.push(now);
        self.total = self.total.saturating_add(1);
        self.failures.len() <= self.limit as usize
    }

    /// Whether the failures still inside the window are within `limit`.
    /// Records nothing; used to revive a simulator after it was given up.
    pub fn has_capacity(&mut self) -> bool {
        self.has_capacity_at(Instant::now())
    }

    fn has_capacity_at(&mut self, now: Instant) -> bool {
        self.prune(now);
        self.failures.len() <= self.limit as usize
    }

    fn prune(&mut self, now: Instant) {
        self.failures
            .retain(|t| now.duration_since(*t) < self.window);
    }

    /// Failures recorded over the budget's lifetime.
    #[must_use]
    pub const fn total(&self) -> u32 {
        self.total
    }
}
