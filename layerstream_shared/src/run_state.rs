use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RunStateError {
    #[error("Invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition { from: RunState, to: RunState },
}

/// How a run is driven. Selected once per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessMode {
    /// Geometry from a slice source, PLC handshake enforced.
    Production,
    /// Synthetic geometry, no PLC dependency, laser held at zero power.
    Test,
}

impl ProcessMode {
    pub fn uses_handshake(self) -> bool {
        matches!(self, ProcessMode::Production)
    }
}

/// Orchestrator lifecycle. Owned by the control thread; workers only see flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RunState {
    #[default]
    Idle,
    Starting,
    Running,
    Paused,
    EmergencyStopped,
}

impl RunState {
    pub fn can_transition_to(self, to: RunState) -> bool {
        use RunState::*;
        match (self, to) {
            (Idle, Starting) => true,
            (Starting, Running) | (Starting, Idle) => true,
            (Running, Paused) | (Paused, Running) => true,
            (Running, Idle) | (Paused, Idle) => true,
            // Emergency stop is reachable from every state
            (_, EmergencyStopped) => true,
            // Operator acknowledgement
            (EmergencyStopped, Idle) => true,
            _ => false,
        }
    }

    pub fn transition(&mut self, to: RunState) -> Result<(), RunStateError> {
        if !self.can_transition_to(to) {
            return Err(RunStateError::InvalidTransition { from: *self, to });
        }
        tracing::debug!("Run state {:?} -> {:?}", self, to);
        *self = to;
        Ok(())
    }

    /// A run is active while worker threads may exist.
    pub fn is_active(self) -> bool {
        matches!(self, RunState::Starting | RunState::Running | RunState::Paused)
    }
}
