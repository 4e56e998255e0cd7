//! The aggregate load ledger.
//!
//! One mutex guards all four dimensions so an increase either applies
//! completely or not at all. The new total is pushed to the sink while the
//! lock is still held, so the sink observes totals in the order they were
//! produced.

#![allow(missing_docs)]

use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::errors::{Dimension, Result, SlgError};
use crate::load::resources::ResourceLoad;
use crate::load::spec::MAX_CPU_PCT;

/// Receives every new aggregate total.
pub trait LoadSink: Send + Sync {
    fn push(&self, total: ResourceLoad);
}

/// Sink that applies nothing. Used for dry runs and ledger-only tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl LoadSink for NullSink {
    fn push(&self, _total: ResourceLoad) {}
}

pub struct LoadAggregator {
    state: Mutex<ResourceLoad>,
    sink: Arc<dyn LoadSink>,
}

impl std::fmt::Debug for LoadAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadAggregator")
            .field("current", &self.current())
            .finish_non_exhaustive()
    }
}

impl LoadAggregator {
    #[must_use]
    pub fn new(sink: Arc<dyn LoadSink>) -> Self {
        Self {
            state: Mutex::new(ResourceLoad::ZERO),
            sink,
        }
    }

    /// Ledger with no downstream consumer.
    #[must_use]
    pub fn detached() -> Self {
        Self::new(Arc::new(NullSink))
    }

    #[must_use]
    pub fn current(&self) -> ResourceLoad {
        *self.state.lock()
    }

    /// Add `delta` to the total. CPU may not exceed 100; the other dimensions
    /// only reject `u64` overflow.
    pub fn increase_by(&self, delta: &ResourceLoad) -> Result<ResourceLoad> {
        let mut state = self.state.lock();
        let mut next = *state;
        for dimension in Dimension::ALL {
            let current = state.get(dimension);
            let added = delta.get(dimension);
            let limit = ceiling(dimension);
            match current.checked_add(added) {
                Some(total) if total <= limit => next.set(dimension, total),
                sum => {
                    return Err(SlgError::Admission {
                        dimension,
                        attempted: sum.unwrap_or(u64::MAX),
                        limit,
                    });
                }
            }
        }
        if next != *state {
            *state = next;
            self.sink.push(next);
        }
        Ok(next)
    }

    /// Subtract `delta` from the total. Going below zero on any dimension is a
    /// logic error upstream and leaves the ledger untouched.
    pub fn decrease_by(&self, delta: &ResourceLoad) -> Result<ResourceLoad> {
        let mut state = self.state.lock();
        let mut next = *state;
        for dimension in Dimension::ALL {
            let current = state.get(dimension);
            let removed = delta.get(dimension);
            let Some(total) = current.checked_sub(removed) else {
                return Err(SlgError::Release {
                    dimension,
                    current,
                    delta: removed,
                });
            };
            next.set(dimension, total);
        }
        if next != *state {
            *state = next;
            self.sink.push(next);
        }
        Ok(next)
    }
}

const fn ceiling(dimension: Dimension) -> u64 {
    match dimension {
        Dimension::Cpu => MAX_CPU_PCT as u64,
        Dimension::Memory | Dimension::DiskInput | Dimension::DiskOutput => u64::MAX,
    }
}
