//! KBUS cycle engine lifecycle state machine.
//!
//! Transitions follow the fieldbus coupler's own lifecycle:
//! UNINIT -> INIT -> RUNNING <-> ERROR_RECOVERY; RUNNING -> STOPPED.
//!
//! `ERROR_RECOVERY` is the bus-error loop of the cycle body (poll error,
//! re-run setup, resume); it is not a fault latch and always returns to
//! `RUNNING` once the bus error clears.

use crate::error::{GatewayError, GatewayResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle states of the KBUS cycle engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuntimeState {
    /// Before `open()`; no device, no topology.
    #[default]
    Uninit,
    /// Device opened, topology discovered, banks not yet sized.
    Init,
    /// Normal cyclic operation.
    Running,
    /// Bus error detected; the recovery loop is re-establishing the bus.
    ErrorRecovery,
    /// Engine stopped; outputs have been zeroed and the device closed.
    Stopped,
}

impl fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninit => write!(f, "UNINIT"),
            Self::Init => write!(f, "INIT"),
            Self::Running => write!(f, "RUNNING"),
            Self::ErrorRecovery => write!(f, "ERROR_RECOVERY"),
            Self::Stopped => write!(f, "STOPPED"),
        }
    }
}

impl RuntimeState {
    /// Check if a transition to `target` is valid from the current state.
    #[must_use]
    pub fn can_transition_to(&self, target: RuntimeState) -> bool {
        use RuntimeState::{ErrorRecovery, Init, Running, Stopped, Uninit};

        matches!(
            (self, target),
            (Uninit, Init)
                | (Init, Running)
                | (Running, ErrorRecovery)
                | (ErrorRecovery, Running)
                | (Running, Stopped)
                | (ErrorRecovery, Stopped)
        )
    }

    /// Attempt to transition to `target`, returning error if invalid.
    pub fn transition_to(&mut self, target: RuntimeState) -> GatewayResult<()> {
        if self.can_transition_to(target) {
            *self = target;
            Ok(())
        } else {
            Err(GatewayError::InvalidStateTransition {
                from: self.to_string(),
                to: target.to_string(),
            })
        }
    }

    /// Returns true once setup has completed and cycles are running normally.
    #[must_use]
    pub fn is_operational(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Returns true if the engine is recovering from a bus error or stopped.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}

/// State machine wrapper with transition history tracking.
#[derive(Debug, Clone)]
pub struct StateMachine {
    current: RuntimeState,
    previous: Option<RuntimeState>,
    transition_count: u64,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    /// Create a new state machine starting in UNINIT.
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: RuntimeState::Uninit,
            previous: None,
            transition_count: 0,
        }
    }

    /// Get the current state.
    #[must_use]
    pub fn state(&self) -> RuntimeState {
        self.current
    }

    /// Get the previous state (if any transition occurred).
    #[must_use]
    pub fn previous_state(&self) -> Option<RuntimeState> {
        self.previous
    }

    /// Get total number of transitions.
    #[must_use]
    pub fn transition_count(&self) -> u64 {
        self.transition_count
    }

    /// Attempt a state transition.
    pub fn transition(&mut self, target: RuntimeState) -> GatewayResult<()> {
        if self.current.can_transition_to(target) {
            self.previous = Some(self.current);
            self.current = target;
            self.transition_count += 1;
            Ok(())
        } else {
            Err(GatewayError::InvalidStateTransition {
                from: self.current.to_string(),
                to: target.to_string(),
            })
        }
    }

    /// Force a transition into `ERROR_RECOVERY` (no-op if already there or stopped).
    pub fn enter_error_recovery(&mut self) {
        if self.current.can_transition_to(RuntimeState::ErrorRecovery) {
            self.previous = Some(self.current);
            self.current = RuntimeState::ErrorRecovery;
            self.transition_count += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_forward_transitions() {
        let mut sm = StateMachine::new();
        assert_eq!(sm.state(), RuntimeState::Uninit);

        assert!(sm.transition(RuntimeState::Init).is_ok());
        assert_eq!(sm.state(), RuntimeState::Init);

        assert!(sm.transition(RuntimeState::Running).is_ok());
        assert_eq!(sm.state(), RuntimeState::Running);
    }

    #[test]
    fn test_error_recovery_round_trip() {
        let mut sm = StateMachine::new();
        sm.transition(RuntimeState::Init).unwrap();
        sm.transition(RuntimeState::Running).unwrap();

        assert!(sm.transition(RuntimeState::ErrorRecovery).is_ok());
        assert_eq!(sm.state(), RuntimeState::ErrorRecovery);

        assert!(sm.transition(RuntimeState::Running).is_ok());
        assert_eq!(sm.state(), RuntimeState::Running);
    }

    #[test]
    fn test_invalid_transition() {
        let mut sm = StateMachine::new();
        // Uninit -> Running is invalid (must go through Init)
        let result = sm.transition(RuntimeState::Running);
        assert!(result.is_err());
        assert_eq!(sm.state(), RuntimeState::Uninit);
    }

    #[test]
    fn test_stop_from_running_and_error_recovery() {
        let mut sm = StateMachine::new();
        sm.transition(RuntimeState::Init).unwrap();
        sm.transition(RuntimeState::Running).unwrap();
        assert!(sm.transition(RuntimeState::Stopped).is_ok());
        assert_eq!(sm.state(), RuntimeState::Stopped);

        let mut sm2 = StateMachine::new();
        sm2.transition(RuntimeState::Init).unwrap();
        sm2.transition(RuntimeState::Running).unwrap();
        sm2.transition(RuntimeState::ErrorRecovery).unwrap();
        assert!(sm2.transition(RuntimeState::Stopped).is_ok());
    }

    #[test]
    fn test_transition_count() {
        let mut sm = StateMachine::new();
        assert_eq!(sm.transition_count(), 0);

        sm.transition(RuntimeState::Init).unwrap();
        assert_eq!(sm.transition_count(), 1);

        sm.transition(RuntimeState::Running).unwrap();
        assert_eq!(sm.transition_count(), 2);
    }

    #[test]
    fn test_enter_error_recovery() {
        let mut sm = StateMachine::new();
        sm.transition(RuntimeState::Init).unwrap();
        sm.transition(RuntimeState::Running).unwrap();

        sm.enter_error_recovery();
        assert_eq!(sm.state(), RuntimeState::ErrorRecovery);
        assert_eq!(sm.previous_state(), Some(RuntimeState::Running));
    }

    #[test]
    fn test_enter_error_recovery_noop_when_uninit() {
        let mut sm = StateMachine::new();
        assert_eq!(sm.state(), RuntimeState::Uninit);

        // Uninit cannot go directly to ErrorRecovery; this must be a no-op.
        sm.enter_error_recovery();
        assert_eq!(sm.state(), RuntimeState::Uninit);
        assert_eq!(sm.transition_count(), 0);
    }
}
