//! Board lifecycle and per-channel calibration state machines.
//!
//! Board lifecycle:
//! CLOSED → INITIALIZING → RUNNING ⇄ CALIBRATING, with FAULT reachable from
//! every active state and CLOSED reachable from FAULT and RUNNING.

use crate::error::{FdError, FdResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle states of a board handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BoardState {
    /// No resources held.
    #[default]
    Closed,
    /// Running the ordered init steps.
    Initializing,
    /// Capture and compensation active.
    Running,
    /// A recalibration pass holds the calibration lock.
    Calibrating,
    /// A fatal hardware condition was detected.
    Fault,
}

impl fmt::Display for BoardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Initializing => write!(f, "INITIALIZING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Calibrating => write!(f, "CALIBRATING"),
            Self::Fault => write!(f, "FAULT"),
        }
    }
}

impl BoardState {
    /// Check if a transition to `target` is valid from the current state.
    #[must_use]
    pub fn can_transition_to(&self, target: BoardState) -> bool {
        use BoardState::{Calibrating, Closed, Fault, Initializing, Running};

        matches!(
            (self, target),
            (Closed, Initializing)
                | (Initializing, Running)
                | (Running, Calibrating)
                | (Calibrating, Running)
                | (Initializing, Fault)
                | (Running, Fault)
                | (Calibrating, Fault)
                | (Fault, Closed)
                | (Running, Closed)
        )
    }

    /// Returns true while the board handle owns hardware resources.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Calibrating)
    }
}

/// Board state with transition history.
#[derive(Debug, Clone, Default)]
pub struct StateMachine {
    current: BoardState,
    previous: Option<BoardState>,
    transition_count: u64,
}

impl StateMachine {
    /// Create a new state machine starting in CLOSED.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the current state.
    #[must_use]
    pub fn state(&self) -> BoardState {
        self.current
    }

    /// Get the previous state (if any transition occurred).
    #[must_use]
    pub fn previous_state(&self) -> Option<BoardState> {
        self.previous
    }

    /// Get total number of transitions.
    #[must_use]
    pub fn transition_count(&self) -> u64 {
        self.transition_count
    }

    /// Attempt a state transition.
    ///
    /// # Errors
    ///
    /// Returns [`FdError::InvalidStateTransition`] if `target` is not reachable.
    pub fn transition(&mut self, target: BoardState) -> FdResult<()> {
        if self.current.can_transition_to(target) {
            self.previous = Some(self.current);
            self.current = target;
            self.transition_count += 1;
            Ok(())
        } else {
            Err(FdError::InvalidStateTransition {
                from: self.current.to_string(),
                to: target.to_string(),
            })
        }
    }

    /// Move to FAULT if the current state allows it.
    pub fn enter_fault(&mut self) {
        if self.current.can_transition_to(BoardState::Fault) {
            self.previous = Some(self.current);
            self.current = BoardState::Fault;
            self.transition_count += 1;
        }
    }
}

/// Progress of one channel's calibration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationPhase {
    /// Not calibrating.
    #[default]
    Idle,
    /// Averaging the delay at tap 0.
    MeasuringBias,
    /// Bisecting the tap range.
    BinarySearching,
    /// Tap found.
    Converged,
}

impl fmt::Display for CalibrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::MeasuringBias => write!(f, "measuring_bias"),
            Self::BinarySearching => write!(f, "binary_searching"),
            Self::Converged => write!(f, "converged"),
        }
    }
}

impl CalibrationPhase {
    /// Check if a transition to `target` is valid from the current phase.
    #[must_use]
    pub fn can_transition_to(&self, target: CalibrationPhase) -> bool {
        use CalibrationPhase::{BinarySearching, Converged, Idle, MeasuringBias};

        matches!(
            (self, target),
            (Idle, MeasuringBias)
                | (MeasuringBias, BinarySearching)
                | (BinarySearching, Converged)
                | (Converged, MeasuringBias)
                // abort from anywhere
                | (MeasuringBias | BinarySearching | Converged, Idle)
        )
    }

    /// Advance to `target`, returning an error if the step is not allowed.
    ///
    /// # Errors
    ///
    /// Returns [`FdError::InvalidStateTransition`] on an invalid step.
    pub fn transition_to(&mut self, target: CalibrationPhase) -> FdResult<()> {
        if self.can_transition_to(target) {
            *self = target;
            Ok(())
        } else {
            Err(FdError::InvalidStateTransition {
                from: self.to_string(),
                to: target.to_string(),
            })
        }
    }
}
