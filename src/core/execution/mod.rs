//! A2A execution: a plan instantiated as a durable task DAG, advanced one
//! step at a time by [`engine::ExecutionEngine`].

mod engine;
pub mod types;

pub use engine::{ExecutionEngine, TaskAction};
pub use types::{ExecutionRecord, ExecutionState, TaskSnapshot, TaskStatus};

/// Legal task transitions. Completed and skipped are absorbing; everything
/// else may be skipped by an operator or failed by cancellation.
pub fn task_can_transition(from: TaskStatus, to: TaskStatus) -> bool {
    if from == to {
        return true;
    }
    match from {
        TaskStatus::Pending => matches!(
            to,
            TaskStatus::Ready | TaskStatus::Skipped | TaskStatus::Failed
        ),
        TaskStatus::Ready => matches!(
            to,
            TaskStatus::Running | TaskStatus::Completed | TaskStatus::Skipped | TaskStatus::Failed
        ),
        TaskStatus::Running => matches!(
            to,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Blocked | TaskStatus::Skipped
        ),
        TaskStatus::Blocked => matches!(
            to,
            TaskStatus::Running | TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped
        ),
        TaskStatus::Failed => matches!(to, TaskStatus::Ready | TaskStatus::Skipped),
        TaskStatus::Completed | TaskStatus::Skipped => false,
    }
}

/// Legal execution transitions. Terminal states are absorbing.
pub fn execution_can_transition(from: ExecutionState, to: ExecutionState) -> bool {
    if from == to {
        return true;
    }
    match from {
        ExecutionState::Created => matches!(
            to,
            ExecutionState::Running | ExecutionState::Cancelled | ExecutionState::Failed
        ),
        ExecutionState::Running => matches!(
            to,
            ExecutionState::Blocked
                | ExecutionState::Completed
                | ExecutionState::Failed
                | ExecutionState::Cancelled
        ),
        ExecutionState::Blocked => matches!(
            to,
            ExecutionState::Running
                | ExecutionState::Completed
                | ExecutionState::Failed
                | ExecutionState::Cancelled
        ),
        ExecutionState::Completed | ExecutionState::Failed | ExecutionState::Cancelled => false,
    }
}

#[cfg(test)]
mod tests;
