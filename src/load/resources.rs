//! Four-dimensional resource quantities shared by segments and the aggregate ledger.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::errors::Dimension;
use crate::core::units::format_bytes;

/// A load level (or a delta to one) across every simulated resource.
///
/// `cpu` is a percentage of the whole machine; the other fields are bytes
/// (memory) or bytes per second (disk).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceLoad {
    pub cpu: u64,
    pub memory_bytes: u64,
    pub disk_input_bps: u64,
    pub disk_output_bps: u64,
}

impl ResourceLoad {
    pub const ZERO: Self = Self {
        cpu: 0,
        memory_bytes: 0,
        disk_input_bps: 0,
        disk_output_bps: 0,
    };

    #[must_use]
    pub const fn get(&self, dimension: Dimension) -> u64 {
        match dimension {
            Dimension::Cpu => self.cpu,
            Dimension::Memory => self.memory_bytes,
            Dimension::DiskInput => self.disk_input_bps,
            Dimension::DiskOutput => self.disk_output_bps,
        }
    }

    fn slot_mut(&mut self, dimension: Dimension) -> &mut u64 {
        match dimension {
            Dimension::Cpu => &mut self.cpu,
            Dimension::Memory => &mut self.memory_bytes,
            Dimension::DiskInput => &mut self.disk_input_bps,
            Dimension::DiskOutput => &mut self.disk_output_bps,
        }
    }

    /// Overwrite one dimension.
    pub fn set(&mut self, dimension: Dimension, value: u64) {
        *self.slot_mut(dimension) = value;
    }

    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.cpu == 0
            && self.memory_bytes == 0
            && self.disk_input_bps == 0
            && self.disk_output_bps == 0
    }

    /// Dimensions with a non-zero value.
    pub fn touched(&self) -> impl Iterator<Item = Dimension> + '_ {
        Dimension::ALL
            .into_iter()
            .filter(move |dimension| self.get(*dimension) != 0)
    }
}

impl fmt::Display for ResourceLoad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cpu={}% memory={} disk_in={}/s disk_out={}/s",
            self.cpu,
            format_bytes(self.memory_bytes),
            format_bytes(self.disk_input_bps),
            format_bytes(self.disk_output_bps),
        )
    }
}
