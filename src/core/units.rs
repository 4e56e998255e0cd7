//! Time and byte units used by load specifications.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::errors::{Result, SlgError};

/// Unit attached to a segment duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Milliseconds,
    #[default]
    Seconds,
    Minutes,
    Hours,
}

impl TimeUnit {
    /// Milliseconds in one unit.
    #[must_use]
    pub const fn millis_per_unit(self) -> u64 {
        match self {
            Self::Milliseconds => 1,
            Self::Seconds => 1_000,
            Self::Minutes => 60_000,
            Self::Hours => 3_600_000,
        }
    }

    /// Convert `amount` of this unit into a [`Duration`], failing on overflow.
    pub fn to_duration(self, amount: u64) -> Result<Duration> {
        amount
            .checked_mul(self.millis_per_unit())
            .map(Duration::from_millis)
            .ok_or_else(|| {
                SlgError::validation("duration", format!("{amount} {self} overflows"))
            })
    }

    #[must_use]
    pub const fn suffix(self) -> &'static str {
        match self {
            Self::Milliseconds => "ms",
            Self::Seconds => "s",
            Self::Minutes => "m",
            Self::Hours => "h",
        }
    }

    /// Parse a short suffix (`ms`, `s`, `m`, `h`) or a long name.
    #[must_use]
    pub fn from_suffix(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "ms" | "millis" | "milliseconds" => Some(Self::Milliseconds),
            "" | "s" | "sec" | "secs" | "seconds" => Some(Self::Seconds),
            "m" | "min" | "mins" | "minutes" => Some(Self::Minutes),
            "h" | "hr" | "hrs" | "hours" => Some(Self::Hours),
            _ => None,
        }
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// Binary byte units for memory sizes and disk rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ByteUnit {
    #[default]
    Bytes,
    KiB,
    MiB,
    GiB,
    TiB,
}

impl ByteUnit {
    #[must_use]
    pub const fn bytes_per_unit(self) -> u64 {
        match self {
            Self::Bytes => 1,
            Self::KiB => 1 << 10,
            Self::MiB => 1 << 20,
            Self::GiB => 1 << 30,
            Self::TiB => 1 << 40,
        }
    }

    /// Convert `amount` of this unit to bytes, failing on overflow.
    pub fn to_bytes(self, field: &'static str, amount: u64) -> Result<u64> {
        amount
            .checked_mul(self.bytes_per_unit())
            .ok_or_else(|| SlgError::validation(field, format!("{amount} {self} overflows u64")))
    }

    /// Parse a unit suffix. Decimal spellings (`KB`, `MB`, ...) are read as
    /// their binary counterparts.
    #[must_use]
    pub fn from_suffix(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "b" | "byte" | "bytes" => Some(Self::Bytes),
            "k" | "kb" | "kib" => Some(Self::KiB),
            "m" | "mb" | "mib" => Some(Self::MiB),
            "g" | "gb" | "gib" => Some(Self::GiB),
            "t" | "tb" | "tib" => Some(Self::TiB),
            _ => None,
        }
    }
}

impl fmt::Display for ByteUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Bytes => "B",
            Self::KiB => "KiB",
            Self::MiB => "MiB",
            Self::GiB => "GiB",
            Self::TiB => "TiB",
        };
        f.write_str(label)
    }
}

/// Render a byte count with the largest unit that keeps it >= 1.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [ByteUnit; 4] = [ByteUnit::TiB, ByteUnit::GiB, ByteUnit::MiB, ByteUnit::KiB];
    for unit in UNITS {
        let size = unit.bytes_per_unit();
        if bytes >= size {
            return format!("{:.1} {unit}", bytes as f64 / size as f64);
        }
    }
    format!("{bytes} B")
}
