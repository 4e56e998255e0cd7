//! Proportional CPU feedback with hysteresis.
//!
//! The controller compares measured process CPU against the desired aggregate
//! and decides how many CPU workers to nudge by one setpoint unit. It does not
//! act on the first sample after a target change, nor while the signal is
//! still moving by more than the threshold between samples.

#![allow(missing_docs)]
#![allow(clippy::cast_precision_loss)]

use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergenceState {
    /// Desired CPU is zero.
    #[default]
    Idle,
    /// Waiting for a usable sample or correcting drift.
    Adjusting,
    /// Measured usage is within the threshold of the target.
    Converged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    #[must_use]
    pub const fn delta(self) -> i8 {
        match self {
            Self::Up => 1,
            Self::Down => -1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackDecision {
    Hold,
    Nudge {
        direction: Direction,
        simulators: usize,
    },
}

#[derive(Debug, Clone)]
pub struct FeedbackController {
    desired: u64,
    threshold_pct: f64,
    simulators: usize,
    previous: Option<f64>,
    state: ConvergenceState,
}

impl FeedbackController {
    /// `simulators` is the number of CPU workers, one per core.
    #[must_use]
    pub fn new(threshold_pct: f64, simulators: usize) -> Self {
        Self {
            desired: 0,
            threshold_pct,
            simulators: simulators.max(1),
            previous: None,
            state: ConvergenceState::Idle,
        }
    }

    #[must_use]
    pub const fn state(&self) -> ConvergenceState {
        self.state
    }

    #[must_use]
    pub const fn desired(&self) -> u64 {
        self.desired
    }

    /// Switch to a new desired CPU percentage. The next sample is discarded.
    pub fn retarget(&mut self, desired: u64) {
        if desired == self.desired && self.state != ConvergenceState::Idle {
            return;
        }
        self.desired = desired;
        self.previous = None;
        self.state = if desired == 0 {
            ConvergenceState::Idle
        } else {
            ConvergenceState::Adjusting
        };
    }

    /// Feed one measured sample (percent of the whole machine).
    pub fn observe(&mut self, actual: f64) -> FeedbackDecision {
        if self.desired == 0 {
            self.state = ConvergenceState::Idle;
            return FeedbackDecision::Hold;
        }
        let Some(previous) = self.previous.replace(actual) else {
            self.state = ConvergenceState::Adjusting;
            return FeedbackDecision::Hold;
        };

        let difference = actual - self.desired as f64;
        if difference.abs() <= self.threshold_pct {
            self.state = ConvergenceState::Converged;
            return FeedbackDecision::Hold;
        }
        self.state = ConvergenceState::Adjusting;
        if (actual - previous).abs() > self.threshold_pct {
            return FeedbackDecision::Hold;
        }

        // One setpoint unit on one worker moves the whole machine by 1/n percent.
        let step = 1.0 / self.simulators as f64;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let wanted = (difference.abs() / step).round() as usize;
        FeedbackDecision::Nudge {
            direction: if difference > 0.0 {
                Direction::Down
            } else {
                Direction::Up
            },
            simulators: wanted.clamp(1, self.simulators),
        }
    }
}
