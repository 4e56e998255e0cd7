//! Measurement and feedback: process CPU sampling and the convergence state machine.

pub mod cpu_usage;
pub mod feedback;
