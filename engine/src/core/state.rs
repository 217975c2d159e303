//! Workflow lifecycle state machine.
//!
//! A run's state is never stored; it is the state of the most recent
//! `workflowState` event in its chain (`pending` when there is none).
//!
//! ```text
//! pending ──► running ──► completed
//!                   ├───► error
//!                   └───► timedOut
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::event::Event;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkflowState {
    #[default]
    Pending,
    Running,
    Completed,
    Error,
    TimedOut,
}

impl WorkflowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowState::Pending => "pending",
            WorkflowState::Running => "running",
            WorkflowState::Completed => "completed",
            WorkflowState::Error => "error",
            WorkflowState::TimedOut => "timedOut",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowState::Completed | WorkflowState::Error | WorkflowState::TimedOut
        )
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("run already ended in {from}; refusing transition to {to}")]
    AlreadyTerminal {
        from: WorkflowState,
        to: WorkflowState,
    },
    #[error("invalid lifecycle transition {from} -> {to}")]
    Invalid {
        from: WorkflowState,
        to: WorkflowState,
    },
}

/// Check that moving from `current` to `next` is a legal lifecycle step.
pub fn check_transition(current: WorkflowState, next: WorkflowState) -> Result<(), TransitionError> {
    if current.is_terminal() {
        return Err(TransitionError::AlreadyTerminal {
            from: current,
            to: next,
        });
    }
    let allowed = match current {
        WorkflowState::Pending => next == WorkflowState::Running,
        WorkflowState::Running => next.is_terminal(),
        _ => false,
    };
    if allowed {
        Ok(())
    } else {
        Err(TransitionError::Invalid {
            from: current,
            to: next,
        })
    }
}

/// Derive the current state from a run's chain (in chain order).
pub fn derive_state<'a>(events: impl IntoIterator<Item = &'a Event>) -> WorkflowState {
    events
        .into_iter()
        .filter_map(|event| event.payload.lifecycle_state())
        .last()
        .unwrap_or_default()
}
