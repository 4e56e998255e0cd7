//! Disk read and write simulators.
//!
//! Each simulator thread moves up to `target` bytes per one-second window in
//! `io_chunk_bytes` pieces, then sleeps what is left of the window. With a zero
//! target it parks on a condvar. The endpoint is opened lazily on the first
//! non-zero target, so an idle simulator never touches the disk.

#![allow(missing_docs)]

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rand::RngCore;

use crate::core::config::DiskConfig;
use crate::core::errors::{Result, SlgError};
use crate::simulator::backing;

const WINDOW: Duration = Duration::from_secs(1);

/// "Read up to N bytes" capability.
pub trait ByteSource: Send {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// "Write N bytes" capability.
pub trait ByteSink: Send {
    fn write(&mut self, buf: &[u8]) -> io::Result<()>;
}

/// Reads a file front to back, starting over at EOF.
pub struct FileSource {
    file: File,
}

impl FileSource {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|err| SlgError::io(path, err))?;
        Ok(Self { file })
    }
}

impl ByteSource for FileSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.file.read(buf)?;
        if n > 0 || buf.is_empty() {
            return Ok(n);
        }
        self.file.seek(SeekFrom::Start(0))?;
        match self.file.read(buf)? {
            0 => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "backing file is empty",
            )),
            n => Ok(n),
        }
    }
}

/// Writes into a file that wraps back to offset zero once it reaches `wrap_at`.
pub struct FileSink {
    file: File,
    position: u64,
    wrap_at: u64,
}

impl FileSink {
    pub fn create(path: &Path, wrap_at: u64) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| SlgError::io(parent, err))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|err| SlgError::io(path, err))?;
        Ok(Self {
            file,
            position: 0,
            wrap_at: wrap_at.max(1),
        })
    }
}

impl ByteSink for FileSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        self.file.write_all(buf)?;
        self.position += buf.len() as u64;
        if self.position >= self.wrap_at {
            self.file.sync_data()?;
            self.file.seek(SeekFrom::Start(0))?;
            self.position = 0;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskDirection {
    Input,
    Output,
}

impl DiskDirection {
    #[must_use]
    pub const fn simulator_name(self) -> &'static str {
        match self {
            Self::Input => "disk-input",
            Self::Output => "disk-output",
        }
    }
}

impl fmt::Display for DiskDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.simulator_name())
    }
}

/// An opened source or sink plus the path used in error reports.
pub enum Endpoint {
    Source {
        source: Box<dyn ByteSource>,
        label: PathBuf,
    },
    Sink {
        sink: Box<dyn ByteSink>,
        label: PathBuf,
    },
}

impl Endpoint {
    fn transfer(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self {
            Self::Source { source, label } => {
                source.read(buf).map_err(|err| SlgError::io(&*label, err))
            }
            Self::Sink { sink, label } => sink
                .write(buf)
                .map(|()| buf.len())
                .map_err(|err| SlgError::io(&*label, err)),
        }
    }

    const fn is_sink(&self) -> bool {
        matches!(self, Self::Sink { .. })
    }
}

/// Deferred endpoint construction, run on the simulator thread.
pub type EndpointOpener = Box<dyn FnOnce() -> Result<Endpoint> + Send>;

/// Opener for the read side: provisions the backing file, then reads it.
#[must_use]
pub fn file_input(config: &DiskConfig) -> EndpointOpener {
    let path = backing::input_path(config);
    let size = config.input_file_bytes;
    let chunk = config.io_chunk_bytes;
    Box::new(move || {
        if backing::ensure_backing_file(&path, size, chunk)? {
            eprintln!("[SLG-DISK] provisioned {}", path.display());
        }
        Ok(Endpoint::Source {
            source: Box::new(FileSource::open(&path)?),
            label: path,
        })
    })
}

/// Opener for the write side.
#[must_use]
pub fn file_output(config: &DiskConfig) -> EndpointOpener {
    let path = backing::output_path(config);
    let wrap_at = config.output_file_bytes;
    Box::new(move || {
        Ok(Endpoint::Sink {
            sink: Box::new(FileSink::create(&path, wrap_at)?),
            label: path,
        })
    })
}

#[derive(Debug, Default)]
struct DiskShared {
    target_bps: Mutex<u64>,
    wake: Condvar,
    stopping: AtomicBool,
    bytes_moved: AtomicU64,
}

impl DiskShared {
    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }
}

pub struct DiskSimulator {
    direction: DiskDirection,
    shared: Arc<DiskShared>,
    join: Option<JoinHandle<Result<()>>>,
}

impl DiskSimulator {
    pub fn spawn(direction: DiskDirection, chunk_bytes: u64, opener: EndpointOpener) -> Result<Self> {
        let shared = Arc::new(DiskShared::default());
        let worker = Arc::clone(&shared);
        let chunk = usize::try_from(chunk_bytes.max(1)).map_err(|err| {
            SlgError::validation("io_chunk_bytes", format!("does not fit in memory: {err}"))
        })?;
        let join = thread::Builder::new()
            .name(format!("slg-{direction}"))
            .spawn(move || run(&worker, chunk, opener))
            .map_err(|err| SlgError::Runtime {
                details: format!("failed to spawn {direction} simulator: {err}"),
            })?;
        Ok(Self {
            direction,
            shared,
            join: Some(join),
        })
    }

    #[must_use]
    pub const fn direction(&self) -> DiskDirection {
        self.direction
    }

    pub fn set_target(&self, bytes_per_sec: u64) {
        *self.shared.target_bps.lock() = bytes_per_sec;
        self.shared.wake.notify_all();
    }

    #[must_use]
    pub fn target(&self) -> u64 {
        *self.shared.target_bps.lock()
    }

    /// Total bytes read or written since spawn.
    #[must_use]
    pub fn bytes_moved(&self) -> u64 {
        self.shared.bytes_moved.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(JoinHandle::is_finished)
    }

    pub fn take_exit(&mut self) -> Option<Result<()>> {
        if !self.is_finished() {
            return None;
        }
        let join = self.join.take()?;
        let direction = self.direction;
        Some(join.join().unwrap_or_else(|_| {
            Err(SlgError::Runtime {
                details: format!("{direction} simulator panicked"),
            })
        }))
    }

    pub fn shutdown(&mut self) {
        {
            let _target = self.shared.target_bps.lock();
            self.shared.stopping.store(true, Ordering::Release);
        }
        self.shared.wake.notify_all();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for DiskSimulator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(shared: &DiskShared, chunk: usize, opener: EndpointOpener) -> Result<()> {
    let mut opener = Some(opener);
    let mut endpoint: Option<Endpoint> = None;
    let mut buf: Vec<u8> = Vec::new();

    loop {
        let bps = {
            let mut target = shared.target_bps.lock();
            while *target == 0 && !shared.is_stopping() {
                shared.wake.wait(&mut target);
            }
            if shared.is_stopping() {
                return Ok(());
            }
            *target
        };

        if endpoint.is_none() {
            let open = opener.take().ok_or_else(|| SlgError::Runtime {
                details: "disk endpoint opener already consumed".to_string(),
            })?;
            let opened = open()?;
            buf = vec![0u8; chunk];
            if opened.is_sink() {
                rand::rng().fill_bytes(&mut buf);
            }
            endpoint = Some(opened);
        }
        let Some(io) = endpoint.as_mut() else {
            continue;
        };

        let window_start = Instant::now();
        let mut remaining = bps;
        while remaining > 0 && window_start.elapsed() < WINDOW && !shared.is_stopping() {
            let len = usize::try_from(remaining.min(buf.len() as u64)).unwrap_or(buf.len());
            let moved = io.transfer(&mut buf[..len])?;
            remaining = remaining.saturating_sub(moved as u64);
            shared.bytes_moved.fetch_add(moved as u64, Ordering::Relaxed);
        }

        if let Some(rest) = WINDOW.checked_sub(window_start.elapsed()) {
            let mut target = shared.target_bps.lock();
            if *target == bps && !shared.is_stopping() {
                shared.wake.wait_for(&mut target, rest);
            }
        }
    }
}
