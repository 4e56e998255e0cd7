//! Configuration system: TOML file + env var overrides + smart defaults.

#![allow(missing_docs)]

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::errors::{Result, SlgError};

/// Full load generator configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub executor: ExecutorConfig,
    pub controller: ControllerConfig,
    pub cpu: CpuConfig,
    pub memory: MemoryConfig,
    pub disk: DiskConfig,
    pub logging: LoggingConfig,
    pub paths: PathsConfig,
}

/// Limits applied when a load specification is flattened and scheduled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Hard cap on the number of segments one submission may expand to.
    pub max_segments: u64,
    /// Maximum nesting depth of a load tree.
    pub max_depth: usize,
    /// How long `shutdown()` waits for in-flight submissions to unwind.
    pub shutdown_timeout_ms: u64,
}

/// Feedback loop knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControllerConfig {
    /// Sampling interval of the CPU feedback loop.
    pub interval_ms: u64,
    /// Dead band (percentage points) for both the error and the stability check.
    pub threshold_pct: f64,
    /// Number of CPU simulators; 0 means one per available core.
    pub cpu_workers: usize,
    /// Simulator restarts allowed inside `respawn_window_secs`.
    pub respawn_limit: u32,
    pub respawn_window_secs: u64,
}

/// CPU simulator duty-cycle window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CpuConfig {
    pub window_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MemoryConfig {
    /// Size of each allocation chunk backing the simulated footprint.
    pub chunk_bytes: u64,
    /// Largest footprint the simulator will attempt; 0 means unlimited.
    pub max_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DiskConfig {
    /// Directory holding the disk simulators' backing files.
    pub directory: PathBuf,
    /// Size of the read-side backing file. Keep it above the page cache.
    pub input_file_bytes: u64,
    /// Size at which the write-side file wraps back to offset zero.
    pub output_file_bytes: u64,
    /// Largest single read/write issued by a disk simulator.
    pub io_chunk_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub enabled: bool,
    pub jsonl_path: PathBuf,
    pub fallback_path: Option<PathBuf>,
    pub max_size_bytes: u64,
    pub max_rotated_files: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub config_file: PathBuf,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_segments: 1_000_000,
            max_depth: 64,
            shutdown_timeout_ms: 5_000,
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 2_000,
            threshold_pct: 1.0,
            cpu_workers: 0,
            respawn_limit: 3,
            respawn_window_secs: 300,
        }
    }
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self { window_ms: 100 }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            chunk_bytes: 64 * 1024 * 1024,
            max_bytes: 0,
        }
    }
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            directory: env::temp_dir().join("slg"),
            input_file_bytes: 1024 * 1024 * 1024,
            output_file_bytes: 1024 * 1024 * 1024,
            io_chunk_bytes: 4 * 1024 * 1024,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        let home = env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        Self {
            enabled: true,
            jsonl_path: PathBuf::from(format!("{home}/.local/share/slg/activity.jsonl")),
            fallback_path: Some(env::temp_dir().join("slg-activity.jsonl")),
            max_size_bytes: 50 * 1024 * 1024,
            max_rotated_files: 3,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let home = env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        Self {
            config_file: PathBuf::from(format!("{home}/.config/slg/config.toml")),
        }
    }
}

impl ControllerConfig {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    #[must_use]
    pub fn respawn_window(&self) -> Duration {
        Duration::from_secs(self.respawn_window_secs)
    }

    /// Resolve the worker count, falling back to the host's core count.
    #[must_use]
    pub fn effective_cpu_workers(&self, available: usize) -> usize {
        if self.cpu_workers == 0 {
            available.max(1)
        } else {
            self.cpu_workers
        }
    }
}

impl Config {
    /// Default configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathsConfig::default().config_file
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// Missing config file is not an error when loading from default path; defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);
        let is_explicit_path = path.is_some();

        let mut cfg = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf).map_err(|source| SlgError::Io {
                path: path_buf.clone(),
                source,
            })?;
            let parsed: Self = toml::from_str(&raw)?;
            parsed
        } else if is_explicit_path {
            return Err(SlgError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.paths.config_file = path_buf;
        cfg.apply_env_overrides_from(env_var)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Deterministic hash of the effective config for log correlation.
    ///
    /// FNV-1a over the canonical JSON form, stable across processes.
    pub fn stable_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        override_parsed(
            &mut lookup,
            "SLG_EXECUTOR_MAX_SEGMENTS",
            &mut self.executor.max_segments,
        )?;
        override_parsed(
            &mut lookup,
            "SLG_EXECUTOR_MAX_DEPTH",
            &mut self.executor.max_depth,
        )?;
        override_parsed(
            &mut lookup,
            "SLG_CONTROLLER_INTERVAL_MS",
            &mut self.controller.interval_ms,
        )?;
        override_parsed(
            &mut lookup,
            "SLG_CONTROLLER_THRESHOLD_PCT",
            &mut self.controller.threshold_pct,
        )?;
        override_parsed(
            &mut lookup,
            "SLG_CONTROLLER_CPU_WORKERS",
            &mut self.controller.cpu_workers,
        )?;
        override_parsed(&mut lookup, "SLG_CPU_WINDOW_MS", &mut self.cpu.window_ms)?;
        override_parsed(
            &mut lookup,
            "SLG_MEMORY_CHUNK_BYTES",
            &mut self.memory.chunk_bytes,
        )?;
        override_parsed(&mut lookup, "SLG_MEMORY_MAX_BYTES", &mut self.memory.max_bytes)?;
        if let Some(raw) = lookup("SLG_DISK_DIRECTORY") {
            self.disk.directory = PathBuf::from(raw);
        }
        override_parsed(
            &mut lookup,
            "SLG_DISK_INPUT_FILE_BYTES",
            &mut self.disk.input_file_bytes,
        )?;
        override_parsed(
            &mut lookup,
            "SLG_DISK_OUTPUT_FILE_BYTES",
            &mut self.disk.output_file_bytes,
        )?;
        override_parsed(&mut lookup, "SLG_LOGGING_ENABLED", &mut self.logging.enabled)?;
        if let Some(raw) = lookup("SLG_LOGGING_JSONL_PATH") {
            self.logging.jsonl_path = PathBuf::from(raw);
        }
        Ok(())
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.executor.max_segments == 0 {
            return Err(SlgError::InvalidConfig {
                details: "executor.max_segments must be >= 1".to_string(),
            });
        }
        if self.executor.max_depth == 0 {
            return Err(SlgError::InvalidConfig {
                details: "executor.max_depth must be >= 1".to_string(),
            });
        }

        if self.controller.interval_ms == 0 {
            return Err(SlgError::InvalidConfig {
                details: "controller.interval_ms must be > 0".to_string(),
            });
        }
        let threshold = self.controller.threshold_pct;
        if !(threshold > 0.0 && threshold <= 100.0) {
            return Err(SlgError::InvalidConfig {
                details: format!("controller.threshold_pct must be in (0, 100], got {threshold}"),
            });
        }
        if self.controller.respawn_window_secs == 0 {
            return Err(SlgError::InvalidConfig {
                details: "controller.respawn_window_secs must be > 0".to_string(),
            });
        }

        if !(10..=10_000).contains(&self.cpu.window_ms) {
            return Err(SlgError::InvalidConfig {
                details: format!(
                    "cpu.window_ms must be in [10, 10000], got {}",
                    self.cpu.window_ms
                ),
            });
        }

        if self.memory.chunk_bytes == 0 {
            return Err(SlgError::InvalidConfig {
                details: "memory.chunk_bytes must be > 0".to_string(),
            });
        }

        if self.disk.io_chunk_bytes == 0
            || self.disk.input_file_bytes == 0
            || self.disk.output_file_bytes == 0
        {
            return Err(SlgError::InvalidConfig {
                details: "disk file sizes and disk.io_chunk_bytes must be > 0".to_string(),
            });
        }
        if self.disk.io_chunk_bytes > self.disk.input_file_bytes {
            return Err(SlgError::InvalidConfig {
                details: format!(
                    "disk.io_chunk_bytes ({}) must be <= disk.input_file_bytes ({})",
                    self.disk.io_chunk_bytes, self.disk.input_file_bytes
                ),
            });
        }

        if self.logging.max_size_bytes == 0 {
            return Err(SlgError::InvalidConfig {
                details: "logging.max_size_bytes must be > 0".to_string(),
            });
        }

        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|raw| !raw.trim().is_empty())
}

fn override_parsed<F, T>(lookup: &mut F, name: &str, slot: &mut T) -> Result<()>
where
    F: FnMut(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(name) {
        *slot = raw.trim().parse::<T>().map_err(|error| SlgError::ConfigParse {
            context: "env",
            details: format!("{name}={raw:?}: {error}"),
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{Config, SlgError};
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(name, value)| ((*name).to_string(), (*value).to_string()))
            .collect()
    }

    #[test]
    fn default_config_is_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn stable_hash_changes_when_config_changes() {
        let cfg = Config::default();
        let hash_before = cfg.stable_hash().expect("hash should compute");
        let mut modified = Config::default();
        modified.executor.max_depth += 1;
        let hash_after = modified.stable_hash().expect("hash should compute");
        assert_ne!(hash_before, hash_after);
    }

    #[test]
    fn stable_hash_deterministic() {
        let cfg = Config::default();
        assert_eq!(cfg.stable_hash().unwrap(), cfg.stable_hash().unwrap());
    }

    #[test]
    fn zero_interval_rejected() {
        let mut cfg = Config::default();
        cfg.controller.interval_ms = 0;
        let err = cfg.validate().expect_err("expected interval error");
        assert!(err.to_string().contains("interval_ms"));
    }

    #[test]
    fn threshold_out_of_range_rejected() {
        let mut cfg = Config::default();
        cfg.controller.threshold_pct = 0.0;
        assert!(cfg.validate().is_err());
        cfg.controller.threshold_pct = 150.0;
        let err = cfg.validate().expect_err("expected threshold error");
        assert!(err.to_string().contains("threshold_pct"));
    }

    #[test]
    fn cpu_window_bounds_enforced() {
        let mut cfg = Config::default();
        cfg.cpu.window_ms = 5;
        let err = cfg.validate().expect_err("expected window error");
        assert!(err.to_string().contains("window_ms"));
    }

    #[test]
    fn io_chunk_larger_than_input_file_rejected() {
        let mut cfg = Config::default();
        cfg.disk.input_file_bytes = 1024;
        cfg.disk.io_chunk_bytes = 4096;
        let err = cfg.validate().expect_err("expected chunk error");
        assert!(err.to_string().contains("io_chunk_bytes"));
    }

    #[test]
    fn env_overrides_replace_defaults() {
        let mut cfg = Config::default();
        let overrides = vars(&[
            ("SLG_CONTROLLER_INTERVAL_MS", "250"),
            ("SLG_CONTROLLER_CPU_WORKERS", "2"),
            ("SLG_MEMORY_MAX_BYTES", "4096"),
            ("SLG_DISK_DIRECTORY", "/tmp/slg-env"),
            ("SLG_LOGGING_ENABLED", "false"),
        ]);

        cfg.apply_env_overrides_from(|name| overrides.get(name).cloned())
            .expect("env overrides should parse");

        assert_eq!(cfg.controller.interval_ms, 250);
        assert_eq!(cfg.controller.cpu_workers, 2);
        assert_eq!(cfg.memory.max_bytes, 4096);
        assert_eq!(cfg.disk.directory, PathBuf::from("/tmp/slg-env"));
        assert!(!cfg.logging.enabled);
    }

    #[test]
    fn env_invalid_number_rejected() {
        let mut cfg = Config::default();
        let overrides = vars(&[("SLG_EXECUTOR_MAX_DEPTH", "deep")]);

        let err = cfg
            .apply_env_overrides_from(|name| overrides.get(name).cloned())
            .expect_err("invalid number should fail");
        match err {
            SlgError::ConfigParse { context, details } => {
                assert_eq!(context, "env");
                assert!(details.contains("SLG_EXECUTOR_MAX_DEPTH"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn effective_cpu_workers_falls_back_to_core_count() {
        let mut cfg = Config::default();
        assert_eq!(cfg.controller.effective_cpu_workers(8), 8);
        assert_eq!(cfg.controller.effective_cpu_workers(0), 1);
        cfg.controller.cpu_workers = 3;
        assert_eq!(cfg.controller.effective_cpu_workers(8), 3);
    }

    #[test]
    fn load_returns_error_for_explicit_missing_path() {
        let result = Config::load(Some(Path::new("/nonexistent/slg/config.toml")));
        assert!(matches!(result, Err(SlgError::MissingConfig { .. })));
    }

    #[test]
    fn load_reads_partial_toml_and_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[controller]\ninterval_ms = 500\n").unwrap();

        let cfg = Config::load(Some(&path)).expect("config should load");
        assert_eq!(cfg.controller.interval_ms, 500);
        assert_eq!(cfg.cpu.window_ms, 100);
        assert_eq!(cfg.paths.config_file, path);
    }

    #[test]
    fn toml_rendering_parses_back() {
        let cfg = Config::default();
        let rendered = cfg.to_toml().expect("render");
        let parsed: Config = toml::from_str(&rendered).expect("parse back");
        assert_eq!(parsed, cfg);
    }
}
