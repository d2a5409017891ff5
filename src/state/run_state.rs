/// Automation run state machine
///
/// Stopped --start--> Running --pause--> Paused --resume--> Running,
/// and Running | Paused --stop--> Stopped.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::ControlError;

/// Status of one automation group
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum RunStatus {
    /// Not running (initial and terminal state)
    #[default]
    Stopped,

    /// Worker is capturing and matching
    Running,

    /// Worker is alive but idles until resumed
    Paused,
}

impl RunStatus {
    /// Check if automation is stopped
    pub fn is_stopped(&self) -> bool {
        matches!(self, RunStatus::Stopped)
    }

    /// Check if automation is running (not paused)
    pub fn is_running(&self) -> bool {
        matches!(self, RunStatus::Running)
    }

    /// Check if automation is paused
    pub fn is_paused(&self) -> bool {
        matches!(self, RunStatus::Paused)
    }

    /// Running or paused: a worker exists for this group
    pub fn is_active(&self) -> bool {
        !self.is_stopped()
    }

    /// Get a human-readable description of the state
    pub fn description(&self) -> &'static str {
        match self {
            RunStatus::Stopped => "Stopped",
            RunStatus::Running => "Running",
            RunStatus::Paused => "Paused",
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            RunStatus::Stopped => 0,
            RunStatus::Running => 1,
            RunStatus::Paused => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => RunStatus::Running,
            2 => RunStatus::Paused,
            _ => RunStatus::Stopped,
        }
    }
}

/// Why a run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Stop requested by the operator
    Operator,

    /// Nothing qualified for longer than the inactivity limit
    InactivityTimeout,

    /// The worker hit an unexpected failure and was torn down
    Fault(String),
}

impl StopReason {
    pub fn description(&self) -> String {
        match self {
            StopReason::Operator => "Stopped by operator".to_string(),
            StopReason::InactivityTimeout => "Stopped after inactivity timeout".to_string(),
            StopReason::Fault(message) => format!("Stopped after error: {}", message),
        }
    }
}

/// Atomic status shared between the controller and its worker
#[derive(Debug, Default)]
pub struct StatusCell(AtomicU8);

impl StatusCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> RunStatus {
        RunStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Stopped -> Running
    pub fn start(&self) -> Result<(), ControlError> {
        self.transition(RunStatus::Stopped, RunStatus::Running)
            .map_err(|_| ControlError::AlreadyRunning)
    }

    /// Running -> Paused
    pub fn pause(&self) -> Result<(), ControlError> {
        self.transition(RunStatus::Running, RunStatus::Paused)
            .map_err(|current| invalid_transition("pause", current))
    }

    /// Paused -> Running
    pub fn resume(&self) -> Result<(), ControlError> {
        self.transition(RunStatus::Paused, RunStatus::Running)
            .map_err(|current| invalid_transition("resume", current))
    }

    /// Any -> Stopped, returning the previous status
    pub fn stop(&self) -> RunStatus {
        RunStatus::from_u8(self.0.swap(RunStatus::Stopped.as_u8(), Ordering::AcqRel))
    }

    fn transition(&self, from: RunStatus, to: RunStatus) -> Result<(), RunStatus> {
        self.0
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(RunStatus::from_u8)
    }
}

fn invalid_transition(action: &'static str, current: RunStatus) -> ControlError {
    ControlError::InvalidTransition {
        action,
        status: current.description(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_predicates() {
        assert!(RunStatus::Stopped.is_stopped());
        assert!(!RunStatus::Stopped.is_active());
        assert!(RunStatus::Running.is_running());
        assert!(RunStatus::Running.is_active());
        assert!(RunStatus::Paused.is_paused());
        assert!(RunStatus::Paused.is_active());
        assert_eq!(RunStatus::default(), RunStatus::Stopped);
    }

    #[test]
    fn test_status_cell_transitions() {
        let cell = StatusCell::new();
        assert_eq!(cell.get(), RunStatus::Stopped);

        assert!(cell.pause().is_err());
        assert!(cell.resume().is_err());

        cell.start().unwrap();
        assert_eq!(cell.get(), RunStatus::Running);
        assert!(matches!(cell.start(), Err(ControlError::AlreadyRunning)));

        cell.pause().unwrap();
        assert_eq!(cell.get(), RunStatus::Paused);
        assert!(matches!(cell.start(), Err(ControlError::AlreadyRunning)));

        cell.resume().unwrap();
        assert_eq!(cell.get(), RunStatus::Running);

        assert_eq!(cell.stop(), RunStatus::Running);
        assert_eq!(cell.get(), RunStatus::Stopped);
    }

    #[test]
    fn test_invalid_transition_message() {
        let cell = StatusCell::new();
        let err = cell.resume().unwrap_err();
        assert_eq!(err.to_string(), "Cannot resume while Stopped");
    }

    #[test]
    fn test_stop_reason_description() {
        assert_eq!(
            StopReason::InactivityTimeout.description(),
            "Stopped after inactivity timeout"
        );
        assert_eq!(
            StopReason::Fault("boom".into()).description(),
            "Stopped after error: boom"
        );
    }
}
