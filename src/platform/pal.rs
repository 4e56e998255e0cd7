//! Host access: process CPU accounting, core count, memory and mount facts.

#![allow(missing_docs)]

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::core::errors::{Result, SlgError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MountPoint {
    pub path: PathBuf,
    pub fs_type: String,
    pub is_ram_backed: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemoryInfo {
    pub total_bytes: u64,
    pub available_bytes: u64,
}

/// OS facts the simulators and the controller depend on.
pub trait Platform: Send + Sync {
    /// User plus system CPU time consumed by this process so far.
    fn process_cpu_time(&self) -> Result<Duration>;
    fn cpu_count(&self) -> usize;
    fn memory_info(&self) -> Result<MemoryInfo>;
    fn process_rss_bytes(&self) -> Result<u64>;
    /// Whether `path` lives on tmpfs or a similar RAM-backed filesystem.
    fn is_ram_backed(&self, path: &Path) -> Result<bool>;
}

/// `/proc` + `getrusage` implementation.
#[derive(Debug)]
pub struct LinuxPlatform {
    mounts: RwLock<Option<(Vec<MountPoint>, Instant)>>,
    mounts_ttl: Duration,
}

impl Default for LinuxPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl LinuxPlatform {
    #[must_use]
    pub fn new() -> Self {
        Self {
            mounts: RwLock::new(None),
            mounts_ttl: Duration::from_secs(10),
        }
    }

    fn mount_table(&self) -> Result<Vec<MountPoint>> {
        if let Some((mounts, read_at)) = &*self.mounts.read()
            && read_at.elapsed() < self.mounts_ttl
        {
            return Ok(mounts.clone());
        }
        let raw = read_proc("/proc/self/mounts")?;
        let mounts = parse_mounts(&raw);
        *self.mounts.write() = Some((mounts.clone(), Instant::now()));
        Ok(mounts)
    }
}

fn read_proc(path: &str) -> Result<String> {
    fs::read_to_string(path).map_err(|err| SlgError::io(path, err))
}

impl Platform for LinuxPlatform {
    #[cfg(unix)]
    fn process_cpu_time(&self) -> Result<Duration> {
        use nix::sys::resource::{UsageWho, getrusage};

        let usage = getrusage(UsageWho::RUSAGE_SELF).map_err(|err| SlgError::PlatformProbe {
            probe: "getrusage",
            details: err.to_string(),
        })?;
        Ok(timeval_to_duration(usage.user_time()) + timeval_to_duration(usage.system_time()))
    }

    #[cfg(not(unix))]
    fn process_cpu_time(&self) -> Result<Duration> {
        Err(SlgError::UnsupportedPlatform {
            details: "process CPU time needs getrusage".to_string(),
        })
    }

    fn cpu_count(&self) -> usize {
        std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
    }

    fn memory_info(&self) -> Result<MemoryInfo> {
        parse_meminfo(&read_proc("/proc/meminfo")?)
    }

    fn process_rss_bytes(&self) -> Result<u64> {
        parse_status_rss(&read_proc("/proc/self/status")?)
    }

    fn is_ram_backed(&self, path: &Path) -> Result<bool> {
        let mounts = self.mount_table()?;
        Ok(mount_for(path, &mounts).is_some_and(|mount| mount.is_ram_backed))
    }
}

#[cfg(unix)]
fn timeval_to_duration(tv: nix::sys::time::TimeVal) -> Duration {
    let secs = u64::try_from(tv.tv_sec()).unwrap_or(0);
    let micros = u32::try_from(tv.tv_usec()).unwrap_or(0);
    Duration::from_secs(secs) + Duration::from_micros(u64::from(micros))
}

/// Deterministic platform whose CPU clock is advanced by hand.
#[derive(Debug, Clone)]
pub struct MockPlatform {
    cpu_time: Arc<Mutex<Duration>>,
    cpu_count: usize,
    memory: MemoryInfo,
    rss_bytes: u64,
    mounts: Vec<MountPoint>,
}

impl MockPlatform {
    #[must_use]
    pub fn new(cpu_count: usize) -> Self {
        Self {
            cpu_time: Arc::new(Mutex::new(Duration::ZERO)),
            cpu_count: cpu_count.max(1),
            memory: MemoryInfo {
                total_bytes: 16 << 30,
                available_bytes: 8 << 30,
            },
            rss_bytes: 0,
            mounts: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_mounts(mut self, mounts: Vec<MountPoint>) -> Self {
        self.mounts = mounts;
        self
    }

    #[must_use]
    pub const fn with_memory(mut self, total_bytes: u64, available_bytes: u64) -> Self {
        self.memory = MemoryInfo {
            total_bytes,
            available_bytes,
        };
        self
    }

    #[must_use]
    pub const fn with_rss(mut self, rss_bytes: u64) -> Self {
        self.rss_bytes = rss_bytes;
        self
    }

    /// Add CPU time as if the process had been busy for `by`.
    pub fn advance_cpu_time(&self, by: Duration) {
        *self.cpu_time.lock() += by;
    }
}

impl Platform for MockPlatform {
    fn process_cpu_time(&self) -> Result<Duration> {
        Ok(*self.cpu_time.lock())
    }

    fn cpu_count(&self) -> usize {
        self.cpu_count
    }

    fn memory_info(&self) -> Result<MemoryInfo> {
        Ok(self.memory)
    }

    fn process_rss_bytes(&self) -> Result<u64> {
        Ok(self.rss_bytes)
    }

    fn is_ram_backed(&self, path: &Path) -> Result<bool> {
        Ok(mount_for(path, &self.mounts).is_some_and(|mount| mount.is_ram_backed))
    }
}

/// The platform for this build target.
pub fn detect_platform() -> Result<Arc<dyn Platform>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Arc::new(LinuxPlatform::new()))
    }
    #[cfg(not(target_os = "linux"))]
    {
        Err(SlgError::UnsupportedPlatform {
            details: "only Linux is supported".to_string(),
        })
    }
}

fn parse_mounts(raw: &str) -> Vec<MountPoint> {
    raw.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let _device = fields.next()?;
            let path = decode_octal_escapes(fields.next()?);
            let fs_type = fields.next()?.to_string();
            Some(MountPoint {
                path,
                is_ram_backed: matches!(fs_type.as_str(), "tmpfs" | "ramfs" | "devtmpfs"),
                fs_type,
            })
        })
        .collect()
}

fn mount_for<'a>(path: &Path, mounts: &'a [MountPoint]) -> Option<&'a MountPoint> {
    mounts
        .iter()
        .filter(|mount| path.starts_with(&mount.path))
        .max_by_key(|mount| mount.path.as_os_str().len())
}

/// Mount paths encode space, tab, newline and backslash as `\NNN` octal.
fn decode_octal_escapes(raw: &str) -> PathBuf {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let escape = bytes.get(i + 1..i + 4).filter(|digits| {
            bytes[i] == b'\\' && digits.iter().all(|digit| (b'0'..=b'7').contains(digit))
        });
        if let Some(digits) = escape {
            let value = digits
                .iter()
                .fold(0u32, |acc, digit| acc * 8 + u32::from(digit - b'0'));
            out.push(u8::try_from(value).unwrap_or(b'?'));
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStringExt;
        PathBuf::from(std::ffi::OsString::from_vec(out))
    }
    #[cfg(not(unix))]
    {
        PathBuf::from(String::from_utf8_lossy(&out).into_owned())
    }
}

fn kib_field(line: &str) -> Option<(&str, Result<u64>)> {
    let (key, rest) = line.split_once(':')?;
    let mut parts = rest.split_whitespace();
    let parsed = match (parts.next(), parts.next()) {
        (Some(value), unit) => value
            .parse::<u64>()
            .map_err(|err| SlgError::PlatformProbe {
                probe: "proc",
                details: format!("bad number in {line:?}: {err}"),
            })
            .and_then(|value| match unit {
                None => Ok(value),
                Some("kB") => Ok(value.saturating_mul(1024)),
                Some(other) => Err(SlgError::PlatformProbe {
                    probe: "proc",
                    details: format!("unexpected unit {other:?} in {line:?}"),
                }),
            }),
        (None, _) => Err(SlgError::PlatformProbe {
            probe: "proc",
            details: format!("missing value in {line:?}"),
        }),
    };
    Some((key.trim(), parsed))
}

fn parse_meminfo(raw: &str) -> Result<MemoryInfo> {
    let mut values = HashMap::new();
    for line in raw.lines().filter(|line| !line.trim().is_empty()) {
        if let Some((key, value)) = kib_field(line)
            && matches!(key, "MemTotal" | "MemAvailable")
        {
            values.insert(key, value?);
        }
    }
    let field = |key: &'static str| {
        values.get(key).copied().ok_or_else(|| SlgError::PlatformProbe {
            probe: "meminfo",
            details: format!("missing {key}"),
        })
    };
    Ok(MemoryInfo {
        total_bytes: field("MemTotal")?,
        available_bytes: field("MemAvailable")?,
    })
}

fn parse_status_rss(raw: &str) -> Result<u64> {
    raw.lines()
        .filter_map(kib_field)
        .find(|(key, _)| *key == "VmRSS")
        .map(|(_, value)| value)
        .unwrap_or_else(|| {
            Err(SlgError::PlatformProbe {
                probe: "status",
                details: "VmRSS not present".to_string(),
            })
        })
}
