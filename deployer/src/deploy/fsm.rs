//! Finite State Machine for the deployment lifecycle

use serde::{Deserialize, Serialize};

use crate::errors::DeployerError;

/// Deployment state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentState {
    /// Submitted, waiting for a pipeline slot
    Queued,

    /// Workspace, source, install and build stages
    Building,

    /// Publishing to the edge and routing
    Deploying,

    /// Successfully deployed
    Ready,

    /// A stage failed
    Error,

    /// Cancelled by a caller
    Cancelled,
}

impl DeploymentState {
    /// Terminal states accept no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentState::Ready | DeploymentState::Error | DeploymentState::Cancelled
        )
    }
}

impl std::fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeploymentState::Queued => "queued",
            DeploymentState::Building => "building",
            DeploymentState::Deploying => "deploying",
            DeploymentState::Ready => "ready",
            DeploymentState::Error => "error",
            DeploymentState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Lifecycle transition requested by the pipeline or a caller
#[derive(Debug, Clone)]
pub enum Transition {
    /// First stage started
    Build,

    /// Build finished, publishing begins
    Deploy,

    /// Every stage finished
    Complete,

    /// A stage failed
    Fail(String),

    /// Cancelled by a caller
    Cancel,
}

/// Apply `transition` to `state`, returning the next state.
pub fn next_state(
    state: DeploymentState,
    transition: &Transition,
) -> Result<DeploymentState, DeployerError> {
    let next = match (state, transition) {
        // From Queued
        (DeploymentState::Queued, Transition::Build) => DeploymentState::Building,

        // From Building
        (DeploymentState::Building, Transition::Deploy) => DeploymentState::Deploying,

        // From Deploying
        (DeploymentState::Deploying, Transition::Complete) => DeploymentState::Ready,

        // Any non-terminal state may fail or be cancelled
        (s, Transition::Fail(_)) if !s.is_terminal() => DeploymentState::Error,
        (s, Transition::Cancel) if !s.is_terminal() => DeploymentState::Cancelled,

        // Invalid transitions
        (state, transition) => {
            return Err(DeployerError::InvalidTransition(format!(
                "{} -> {:?}",
                state, transition
            )));
        }
    };

    Ok(next)
}

/// Deployment FSM
#[derive(Debug, Clone)]
pub struct DeploymentFsm {
    state: DeploymentState,
    error: Option<String>,
}

impl DeploymentFsm {
    /// Create a new FSM in queued state
    pub fn new() -> Self {
        Self {
            state: DeploymentState::Queued,
            error: None,
        }
    }

    /// Rebuild an FSM from a stored state and error
    pub fn resume(state: DeploymentState, error: Option<String>) -> Self {
        Self { state, error }
    }

    /// Get current state
    pub fn state(&self) -> DeploymentState {
        self.state
    }

    /// Get error message if any
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Process a transition
    pub fn process(&mut self, transition: Transition) -> Result<(), DeployerError> {
        let next = next_state(self.state, &transition)?;
        if let Transition::Fail(err) = transition {
            self.error = Some(err);
        }
        self.state = next;
        Ok(())
    }
}

impl Default for DeploymentFsm {
    fn default() -> Self {
        Self::new()
    }
}
