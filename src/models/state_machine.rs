// Agent lifecycle state machine with validation

use super::AgentState;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateTransitionError {
    #[error("Invalid state transition from {from:?} to {to:?}")]
    InvalidTransition { from: AgentState, to: AgentState },

    #[error("Agent already in terminal state: {0:?}")]
    AlreadyTerminal(AgentState),
}

/// Validates if an agent can transition from one state to another
pub fn can_transition(from: AgentState, to: AgentState) -> bool {
    use AgentState::*;

    match (from, to) {
        // Same state is always allowed (no-op)
        (a, b) if a == b => true,

        // Nothing leaves an absorbing state
        (Completed | Terminated | Error, _) => false,

        // Terminate and error are reachable from every live state
        (_, Terminated | Error) => true,

        // From Created
        (Created, Initializing) => true,
        (Created, Idle) => true,

        // From Initializing
        (Initializing, Idle) => true,

        // From Idle
        (Idle, Initializing) => true, // Restart
        (Idle, Running) => true,
        (Idle, Completing) => true,

        // From Running
        (Running, Idle) => true,
        (Running, Paused) => true,
        (Running, Completing) => true,

        // From Paused - a run may finish while paused
        (Paused, Running) => true,
        (Paused, Idle) => true,

        // From Completing
        (Completing, Completed) => true,

        // All other transitions are invalid
        _ => false,
    }
}

/// Validates and performs a state transition
pub fn transition_state(
    current: AgentState,
    target: AgentState,
) -> Result<AgentState, StateTransitionError> {
    if current != target && is_terminal_state(current) {
        return Err(StateTransitionError::AlreadyTerminal(current));
    }

    if !can_transition(current, target) {
        return Err(StateTransitionError::InvalidTransition {
            from: current,
            to: target,
        });
    }

    Ok(target)
}

/// Check if a state is terminal
pub fn is_terminal_state(state: AgentState) -> bool {
    state.is_finished()
}

/// Check if a state indicates active work
pub fn is_active_state(state: AgentState) -> bool {
    matches!(state, AgentState::Running | AgentState::Paused)
}

/// Get all valid next states from current state
pub fn valid_next_states(current: AgentState) -> Vec<AgentState> {
    use AgentState::*;

    [
        Created,
        Initializing,
        Idle,
        Running,
        Paused,
        Completing,
        Completed,
        Terminated,
        Error,
    ]
    .into_iter()
    .filter(|&state| can_transition(current, state))
    .collect()
}
