//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use system_load_generator::prelude::*;
//! ```

// Core
pub use crate::core::config::Config;
pub use crate::core::errors::{Dimension, Result, SlgError};
pub use crate::core::units::{ByteUnit, TimeUnit};

// Load model
pub use crate::load::builder::LoadSpecBuilder;
pub use crate::load::resources::ResourceLoad;
pub use crate::load::sequencer::{Segment, sequence};
pub use crate::load::spec::LoadSpec;

// Engine
pub use crate::engine::aggregate::{LoadAggregator, LoadSink, NullSink};
pub use crate::engine::controller::{Controller, ControllerSnapshot};
pub use crate::engine::executor::{ExecutionHandle, ExecutionOutcome, ExecutionState, Executor};

// Logging
pub use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle, spawn_logger};

// Platform
pub use crate::platform::pal::{Platform, detect_platform};
