use crate::core::execution::{
    ExecutionState, TaskStatus, execution_can_transition, task_can_transition,
};

#[test]
fn task_happy_path_transitions_are_allowed() {
    let path = [
        (TaskStatus::Pending, TaskStatus::Ready),
        (TaskStatus::Ready, TaskStatus::Running),
        (TaskStatus::Running, TaskStatus::Completed),
    ];
    for (from, to) in path {
        assert!(
            task_can_transition(from, to),
            "expected transition {:?} -> {:?} to be allowed",
            from,
            to
        );
    }
}

#[test]
fn completed_and_skipped_are_absorbing() {
    for to in [
        TaskStatus::Pending,
        TaskStatus::Ready,
        TaskStatus::Running,
        TaskStatus::Failed,
        TaskStatus::Blocked,
    ] {
        assert!(!task_can_transition(TaskStatus::Completed, to));
        assert!(!task_can_transition(TaskStatus::Skipped, to));
    }
}

#[test]
fn failed_task_can_reenter_ready_for_retry() {
    assert!(task_can_transition(TaskStatus::Failed, TaskStatus::Ready));
    assert!(task_can_transition(TaskStatus::Failed, TaskStatus::Skipped));
    assert!(!task_can_transition(TaskStatus::Failed, TaskStatus::Running));
}

#[test]
fn running_task_may_block() {
    assert!(task_can_transition(TaskStatus::Running, TaskStatus::Blocked));
    assert!(task_can_transition(TaskStatus::Blocked, TaskStatus::Running));
}

#[test]
fn execution_terminal_states_are_absorbing() {
    for from in [
        ExecutionState::Completed,
        ExecutionState::Failed,
        ExecutionState::Cancelled,
    ] {
        for to in [
            ExecutionState::Created,
            ExecutionState::Running,
            ExecutionState::Blocked,
            ExecutionState::Completed,
            ExecutionState::Failed,
            ExecutionState::Cancelled,
        ] {
            if from == to {
                continue;
            }
            assert!(
                !execution_can_transition(from, to),
                "{:?} must not leave terminal state",
                from
            );
        }
    }
}

#[test]
fn cancel_is_allowed_from_active_states() {
    for from in [
        ExecutionState::Created,
        ExecutionState::Running,
        ExecutionState::Blocked,
    ] {
        assert!(execution_can_transition(from, ExecutionState::Cancelled));
    }
}

#[test]
fn blocked_execution_can_resume() {
    assert!(execution_can_transition(
        ExecutionState::Running,
        ExecutionState::Blocked
    ));
    assert!(execution_can_transition(
        ExecutionState::Blocked,
        ExecutionState::Running
    ));
}
