#![forbid(unsafe_code)]

//! System load generator (slg): produce controlled, reproducible CPU, memory
//! and disk I/O load on the host.
//!
//! The pieces, leaf first:
//! 1. **Load specifications**: immutable, composable trees of load plus
//!    duration and repetition ([`load::spec::LoadSpec`]).
//! 2. **Sequencing**: pre-order flattening into atomic segments.
//! 3. **Aggregate ledger**: the atomic running total of in-flight load, with
//!    CPU admission at 100%.
//! 4. **Executor**: one thread per submission driving increase, hold and
//!    decrease, with cooperative cancellation.
//! 5. **Controller and simulators**: CPU busy-loop workers under a
//!    proportional feedback loop, a memory holder and disk streamers.
//!
//! # Library usage
//!
//! ```rust,no_run
//! use system_load_generator::prelude::*;
//!
//! # fn main() -> system_load_generator::core::errors::Result<()> {
//! let config = Config::load(None)?;
//! let executor = Executor::start(&config, ActivityLoggerHandle::disabled())?;
//! let spec = LoadSpec::new()
//!     .lasting(30, TimeUnit::Seconds)?
//!     .with_cpu(40)?
//!     .with_memory(256, ByteUnit::MiB)?;
//! executor.execute(&spec)?;
//! executor.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod prelude;

pub mod core;
pub mod engine;
pub mod load;
pub mod logger;
pub mod monitor;
pub mod platform;
pub mod simulator;
