//! Append-only JSON-lines activity log.
//!
//! One self-contained JSON object per line, assembled in memory and written
//! with a single `write_all`, so a tailing reader never sees a torn line.
//!
//! When the primary file is unusable the writer steps down through a fallback
//! file, then stderr (prefixed `[SLG-JSONL]`), then silent discard. Logging
//! problems never stop a load run.

#![allow(missing_docs)]

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::core::config::LoggingConfig;
use crate::core::errors::{Result, SlgError};

const WRITE_BUFFER_BYTES: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Event identifiers as they appear in the `event` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ExecutorStart,
    ExecutorStop,
    SubmissionAccepted,
    SegmentStart,
    SegmentFinish,
    AdmissionRejected,
    SubmissionFinish,
    ReleaseViolation,
    TargetChange,
    ControllerAdjust,
    SimulatorRestart,
    SimulatorFailure,
    MemoryPressure,
    Error,
}

/// One line of the activity log. Only `ts`, `event` and `severity` are always present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub ts: String,
    pub event: EventType,
    pub severity: Severity,
    #[serde(flatten)]
    pub fields: LogFields,
}

/// Optional per-event payload, flattened into the line.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogFields {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segment_index: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_input_bps: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_output_bps: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_cpu: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimension: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempted: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub simulator: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl LogEntry {
    /// Entry stamped with the current UTC time.
    #[must_use]
    pub fn new(event: EventType, severity: Severity) -> Self {
        Self {
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            event,
            severity,
            fields: LogFields::default(),
        }
    }
}

/// Where lines are currently going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterMode {
    Primary,
    Fallback,
    Stderr,
    Discard,
}

impl WriterMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Fallback => "fallback",
            Self::Stderr => "stderr",
            Self::Discard => "discard",
        }
    }
}

#[derive(Debug, Clone)]
pub struct JsonlConfig {
    pub path: PathBuf,
    pub fallback_path: Option<PathBuf>,
    /// Rotate once the current file would grow past this size.
    pub max_size_bytes: u64,
    /// Rotated generations kept as `<path>.1` .. `<path>.N`.
    pub max_rotated_files: u32,
    pub fsync_interval_secs: u64,
}

impl From<&LoggingConfig> for JsonlConfig {
    fn from(logging: &LoggingConfig) -> Self {
        Self {
            path: logging.jsonl_path.clone(),
            fallback_path: logging.fallback_path.clone(),
            max_size_bytes: logging.max_size_bytes,
            max_rotated_files: logging.max_rotated_files,
            fsync_interval_secs: 5,
        }
    }
}

/// Rotating JSONL writer with a degradation chain.
pub struct JsonlWriter {
    config: JsonlConfig,
    file: Option<BufWriter<File>>,
    mode: WriterMode,
    current_size: u64,
    last_sync: Instant,
}

impl JsonlWriter {
    /// Open the primary file, stepping down the chain if that fails.
    #[must_use]
    pub fn open(config: JsonlConfig) -> Self {
        let mut writer = Self {
            config,
            file: None,
            mode: WriterMode::Discard,
            current_size: 0,
            last_sync: Instant::now(),
        };
        let primary = writer.config.path.clone();
        if writer.attach(&primary) {
            writer.mode = WriterMode::Primary;
        } else {
            writer.step_down_from(WriterMode::Primary);
        }
        writer
    }

    pub fn write_entry(&mut self, entry: &LogEntry) {
        match serde_json::to_string(entry) {
            Ok(mut line) => {
                line.push('\n');
                self.write_line(&line);
            }
            Err(err) => {
                let _ = writeln!(io::stderr(), "[SLG-JSONL] cannot serialize entry: {err}");
            }
        }
    }

    pub fn flush(&mut self) {
        if let Some(file) = self.file.as_mut() {
            let _ = file.flush();
        }
    }

    pub fn sync(&mut self) {
        if let Some(file) = self.file.as_mut() {
            let _ = file.flush();
            let _ = file.get_ref().sync_data();
        }
        self.last_sync = Instant::now();
    }

    #[must_use]
    pub const fn mode(&self) -> WriterMode {
        self.mode
    }

    /// Bytes in the current file, including what it held before opening.
    #[must_use]
    pub const fn current_size(&self) -> u64 {
        self.current_size
    }

    // ──────────────────── internals ────────────────────

    fn active_path(&self) -> Option<PathBuf> {
        match self.mode {
            WriterMode::Primary => Some(self.config.path.clone()),
            WriterMode::Fallback => self.config.fallback_path.clone(),
            WriterMode::Stderr | WriterMode::Discard => None,
        }
    }

    fn write_line(&mut self, line: &str) {
        let len = line.len() as u64;
        loop {
            match self.mode {
                WriterMode::Primary | WriterMode::Fallback => {
                    if self.current_size > 0
                        && self.current_size.saturating_add(len) > self.config.max_size_bytes
                    {
                        self.rotate();
                        continue;
                    }
                    let written = self
                        .file
                        .as_mut()
                        .is_some_and(|file| file.write_all(line.as_bytes()).is_ok());
                    if written {
                        self.current_size = self.current_size.saturating_add(len);
                        if self.last_sync.elapsed().as_secs() >= self.config.fsync_interval_secs {
                            self.sync();
                        }
                        return;
                    }
                    self.step_down_from(self.mode);
                }
                WriterMode::Stderr => {
                    if write!(io::stderr(), "[SLG-JSONL] {line}").is_err() {
                        self.mode = WriterMode::Discard;
                    }
                    return;
                }
                WriterMode::Discard => return,
            }
        }
    }

    fn attach(&mut self, path: &Path) -> bool {
        match open_for_append(path) {
            Ok((file, size)) => {
                self.file = Some(BufWriter::with_capacity(WRITE_BUFFER_BYTES, file));
                self.current_size = size;
                true
            }
            Err(_) => false,
        }
    }

    fn step_down_from(&mut self, failed: WriterMode) {
        self.file = None;
        if failed == WriterMode::Primary
            && let Some(fallback) = self.config.fallback_path.clone()
            && self.attach(&fallback)
        {
            let _ = writeln!(
                io::stderr(),
                "[SLG-JSONL] primary log unavailable, writing to {}",
                fallback.display()
            );
            self.mode = WriterMode::Fallback;
            return;
        }
        self.mode = match failed {
            WriterMode::Primary | WriterMode::Fallback => {
                let _ = writeln!(io::stderr(), "[SLG-JSONL] log files unavailable, using stderr");
                WriterMode::Stderr
            }
            WriterMode::Stderr | WriterMode::Discard => WriterMode::Discard,
        };
    }

    fn rotate(&mut self) {
        self.flush();
        self.file = None;
        let Some(base) = self.active_path() else {
            return;
        };

        let keep = self.config.max_rotated_files;
        if keep == 0 {
            let _ = fs::remove_file(&base);
        } else {
            let _ = fs::remove_file(generation_path(&base, keep));
            for generation in (1..keep).rev() {
                let _ = fs::rename(
                    generation_path(&base, generation),
                    generation_path(&base, generation + 1),
                );
            }
            let _ = fs::rename(&base, generation_path(&base, 1));
        }

        if !self.attach(&base) {
            self.step_down_from(self.mode);
        } else {
            self.current_size = 0;
        }
    }
}

impl Drop for JsonlWriter {
    fn drop(&mut self) {
        self.sync();
    }
}

fn open_for_append(path: &Path) -> Result<(File, u64)> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|err| SlgError::io(parent, err))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| SlgError::io(path, err))?;
    let size = file.metadata().map_or(0, |meta| meta.len());
    Ok((file, size))
}

/// `activity.jsonl` -> `activity.jsonl.2`.
fn generation_path(base: &Path, generation: u32) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{generation}"));
    PathBuf::from(name)
}
