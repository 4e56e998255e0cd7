//! Memory simulator: one thread owning an allocation of the target size.
//!
//! Targets arrive over a channel; the thread parks in `recv` while idle and
//! coalesces bursts to the newest target. Each change frees the old buffers
//! and allocates the new size in chunks, touching every page so the memory is
//! resident. A failed allocation ends the thread with `ResourceExhausted`.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::core::config::MemoryConfig;
use crate::core::errors::{Result, SlgError};
use crate::core::units::format_bytes;

const FILL_BYTE: u8 = 0xA5;

enum MemoryCommand {
    Resize(u64),
    Stop,
}

pub struct MemorySimulator {
    tx: Sender<MemoryCommand>,
    allocated: Arc<AtomicU64>,
    join: Option<JoinHandle<Result<()>>>,
}

impl MemorySimulator {
    pub fn spawn(config: &MemoryConfig) -> Result<Self> {
        let (tx, rx) = unbounded();
        let allocated = Arc::new(AtomicU64::new(0));
        let shared = Arc::clone(&allocated);
        let chunk_bytes = config.chunk_bytes.max(1);
        let max_bytes = config.max_bytes;
        let join = thread::Builder::new()
            .name("slg-memory".to_string())
            .spawn(move || run(&rx, &shared, chunk_bytes, max_bytes))
            .map_err(|err| SlgError::Runtime {
                details: format!("failed to spawn memory simulator: {err}"),
            })?;
        Ok(Self {
            tx,
            allocated,
            join: Some(join),
        })
    }

    pub fn set_target(&self, bytes: u64) -> Result<()> {
        self.tx
            .send(MemoryCommand::Resize(bytes))
            .map_err(|_| SlgError::ChannelClosed {
                component: "memory simulator",
            })
    }

    /// Bytes currently held.
    #[must_use]
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated.load(Ordering::Acquire)
    }

    /// Whether the thread has exited (normally or not).
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Collect the exit status of a finished thread. Panics are reported as
    /// `Runtime` errors.
    pub fn take_exit(&mut self) -> Option<Result<()>> {
        if !self.is_finished() {
            return None;
        }
        let join = self.join.take()?;
        Some(join.join().unwrap_or_else(|_| {
            Err(SlgError::Runtime {
                details: "memory simulator panicked".to_string(),
            })
        }))
    }

    pub fn shutdown(&mut self) {
        let _ = self.tx.send(MemoryCommand::Stop);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for MemorySimulator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(
    rx: &Receiver<MemoryCommand>,
    allocated: &AtomicU64,
    chunk_bytes: u64,
    max_bytes: u64,
) -> Result<()> {
    let mut held: Vec<Vec<u8>> = Vec::new();
    while let Ok(first) = rx.recv() {
        let mut command = first;
        while let Ok(newer) = rx.try_recv() {
            command = newer;
        }
        let target = match command {
            MemoryCommand::Stop => break,
            MemoryCommand::Resize(bytes) => bytes,
        };

        drop(std::mem::take(&mut held));
        allocated.store(0, Ordering::Release);
        if max_bytes > 0 && target > max_bytes {
            return Err(SlgError::ResourceExhausted {
                component: "memory simulator",
                details: format!(
                    "target {} exceeds limit {}",
                    format_bytes(target),
                    format_bytes(max_bytes)
                ),
            });
        }
        held = allocate(target, chunk_bytes)?;
        allocated.store(target, Ordering::Release);
    }
    drop(held);
    allocated.store(0, Ordering::Release);
    Ok(())
}

/// Allocate `total` bytes as chunks no larger than `chunk_bytes`.
fn allocate(total: u64, chunk_bytes: u64) -> Result<Vec<Vec<u8>>> {
    let exhausted = |details: String| SlgError::ResourceExhausted {
        component: "memory simulator",
        details,
    };
    let chunk_count = total.div_ceil(chunk_bytes);
    let mut chunks = Vec::new();
    chunks
        .try_reserve_exact(usize::try_from(chunk_count).map_err(|err| exhausted(err.to_string()))?)
        .map_err(|err| exhausted(err.to_string()))?;
    let mut remaining = total;
    while remaining > 0 {
        let len = remaining.min(chunk_bytes);
        let len_usize = usize::try_from(len).map_err(|err| exhausted(err.to_string()))?;
        let mut chunk = Vec::new();
        chunk
            .try_reserve_exact(len_usize)
            .map_err(|err| exhausted(format!("{} chunk: {err}", format_bytes(len))))?;
        chunk.resize(len_usize, FILL_BYTE);
        chunks.push(chunk);
        remaining -= len;
    }
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn allocation_is_chunked() {
        let chunks = allocate(10 * 1024 + 1, 4096).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.iter().map(Vec::len).sum::<usize>(), 10 * 1024 + 1);
        assert!(allocate(0, 4096).unwrap().is_empty());
    }

    #[test]
    fn simulator_tracks_target() {
        let config = MemoryConfig {
            chunk_bytes: 64 * 1024,
            max_bytes: 0,
        };
        let mut sim = MemorySimulator::spawn(&config).unwrap();
        sim.set_target(256 * 1024).unwrap();
        assert!(wait_until(|| sim.allocated_bytes() == 256 * 1024));
        sim.set_target(0).unwrap();
        assert!(wait_until(|| sim.allocated_bytes() == 0));
        sim.shutdown();
        assert!(sim.is_finished());
    }

    #[test]
    fn target_over_limit_ends_the_thread() {
        let config = MemoryConfig {
            chunk_bytes: 4096,
            max_bytes: 8192,
        };
        let mut sim = MemorySimulator::spawn(&config).unwrap();
        sim.set_target(1 << 20).unwrap();
        assert!(wait_until(|| sim.is_finished()));
        let exit = sim.take_exit().unwrap();
        assert!(matches!(exit, Err(SlgError::ResourceExhausted { .. })));
        assert!(sim.set_target(1).is_err());
    }
}
