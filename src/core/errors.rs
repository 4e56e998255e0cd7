//! SLG-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, SlgError>;

/// One resource axis of a load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Cpu,
    Memory,
    DiskInput,
    DiskOutput,
}

impl Dimension {
    /// All dimensions in canonical order.
    pub const ALL: [Self; 4] = [Self::Cpu, Self::Memory, Self::DiskInput, Self::DiskOutput];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Memory => "memory",
            Self::DiskInput => "disk_input",
            Self::DiskOutput => "disk_output",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error type for the load generator.
#[derive(Debug, Error)]
pub enum SlgError {
    #[error("[SLG-1001] invalid value for {field}: {details}")]
    Validation {
        field: &'static str,
        details: String,
    },

    #[error("[SLG-1002] cyclic load composition: {details}")]
    CyclicComposition { details: String },

    #[error("[SLG-1003] load tree deeper than the maximum depth of {max_depth}")]
    DepthExceeded { max_depth: usize },

    #[error("[SLG-1004] load expands to more than {limit} segments")]
    TooManySegments { limit: u64 },

    #[error("[SLG-1005] load description parse failure in {context}: {details}")]
    DescriptionParse {
        context: &'static str,
        details: String,
    },

    #[error("[SLG-2001] admission refused for {dimension}: {attempted} exceeds limit {limit}")]
    Admission {
        dimension: Dimension,
        attempted: u64,
        limit: u64,
    },

    #[error("[SLG-2002] release of {delta} {dimension} would underflow current value {current}")]
    Release {
        dimension: Dimension,
        current: u64,
        delta: u64,
    },

    #[error("[SLG-2003] executor has been shut down")]
    ExecutorShutdown,

    #[error("[SLG-2101] resource exhausted in {component}: {details}")]
    ResourceExhausted {
        component: &'static str,
        details: String,
    },

    #[error("[SLG-3001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[SLG-3002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[SLG-3003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[SLG-3101] unsupported platform: {details}")]
    UnsupportedPlatform { details: String },

    #[error("[SLG-3102] platform probe failed for {probe}: {details}")]
    PlatformProbe {
        probe: &'static str,
        details: String,
    },

    #[error("[SLG-3201] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[SLG-3202] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[SLG-3203] channel closed in component {component}")]
    ChannelClosed { component: &'static str },

    #[error("[SLG-3900] runtime failure: {details}")]
    Runtime { details: String },
}

impl SlgError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "SLG-1001",
            Self::CyclicComposition { .. } => "SLG-1002",
            Self::DepthExceeded { .. } => "SLG-1003",
            Self::TooManySegments { .. } => "SLG-1004",
            Self::DescriptionParse { .. } => "SLG-1005",
            Self::Admission { .. } => "SLG-2001",
            Self::Release { .. } => "SLG-2002",
            Self::ExecutorShutdown => "SLG-2003",
            Self::ResourceExhausted { .. } => "SLG-2101",
            Self::InvalidConfig { .. } => "SLG-3001",
            Self::MissingConfig { .. } => "SLG-3002",
            Self::ConfigParse { .. } => "SLG-3003",
            Self::UnsupportedPlatform { .. } => "SLG-3101",
            Self::PlatformProbe { .. } => "SLG-3102",
            Self::Serialization { .. } => "SLG-3201",
            Self::Io { .. } => "SLG-3202",
            Self::ChannelClosed { .. } => "SLG-3203",
            Self::Runtime { .. } => "SLG-3900",
        }
    }

    /// Whether retrying might resolve the failure.
    ///
    /// Admission failures are retryable: the ceiling frees up as other
    /// submissions finish.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Admission { .. }
                | Self::ResourceExhausted { .. }
                | Self::Io { .. }
                | Self::ChannelClosed { .. }
                | Self::PlatformProbe { .. }
                | Self::Runtime { .. }
        )
    }

    /// Internal invariant violations. These indicate a bug, never bad input.
    #[must_use]
    pub const fn is_logic_error(&self) -> bool {
        matches!(self, Self::Release { .. })
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Convenience constructor for validation errors.
    #[must_use]
    pub fn validation(field: &'static str, details: impl Into<String>) -> Self {
        Self::Validation {
            field,
            details: details.into(),
        }
    }
}

impl From<serde_json::Error> for SlgError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for SlgError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}

impl From<toml::ser::Error> for SlgError {
    fn from(value: toml::ser::Error) -> Self {
        Self::Serialization {
            context: "toml",
            details: value.to_string(),
        }
    }
}
