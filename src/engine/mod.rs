//! Execution engine: the aggregate ledger, the executor that schedules
//! segments onto it, and the controller that turns totals into real load.

pub mod aggregate;
pub mod controller;
pub mod executor;
pub mod health;
#[cfg(feature = "signals")]
pub mod signals;

pub use aggregate::{LoadAggregator, LoadSink, NullSink};
pub use controller::{Controller, ControllerSnapshot};
pub use executor::{ExecutionHandle, ExecutionOutcome, ExecutionState, Executor};
