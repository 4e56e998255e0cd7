//! Structured activity logging: a background JSONL writer fed over a bounded channel.

pub mod activity;
pub mod jsonl;

pub use activity::{ActivityEvent, ActivityLoggerHandle, SubmissionOutcome, spawn_logger};
