//! Core types: configuration, errors and units.

pub mod config;
pub mod errors;
pub mod units;
