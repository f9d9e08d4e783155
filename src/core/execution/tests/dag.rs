//! DAG execution tests: ready-frontier ordering, diamond dependencies,
//! operator actions, cancellation and retry.

use std::sync::Arc;

use crate::config::ExecutionConfig;
use crate::core::agents::{AgentFeatures, AgentRuntime};
use crate::core::error::{EngineError, ErrorKind};
use crate::core::execution::{ExecutionEngine, ExecutionState, TaskAction, TaskStatus};
use crate::core::llm::{LlmRouter, MockProvider};
use crate::core::planning::{LoanType, Plan, PlanTask};
use crate::core::store::Store;
use crate::core::types::{Scene, now_iso};

fn plan_task(id: &str, deps: &[&str], skippable: bool) -> PlanTask {
    PlanTask {
        task_id: id.to_string(),
        title: format!("Task {id}"),
        objective: format!("objective for {id}"),
        assigned_agent: "loan-ops-analyst".to_string(),
        depends_on: deps.iter().map(|s| s.to_string()).collect(),
        tools: AgentFeatures::default(),
        skippable,
    }
}

fn diamond_plan() -> Plan {
    Plan {
        id: "plan-1".to_string(),
        question: "why did overdue rise".to_string(),
        scene: Scene::LoanOps,
        loan_type: LoanType::Mixed,
        workflow_mode: "a2a_dispatch".to_string(),
        tasks: vec![
            plan_task("a", &[], false),
            plan_task("b", &["a"], false),
            plan_task("c", &["a"], true),
            plan_task("d", &["b", "c"], false),
        ],
        edges: vec![
            ("a".into(), "b".into()),
            ("a".into(), "c".into()),
            ("b".into(), "d".into()),
            ("c".into(), "d".into()),
        ],
        rationale: Vec::new(),
        created_at: now_iso(),
    }
}

fn engine_with_provider(provider: Arc<MockProvider>) -> ExecutionEngine {
    let router = Arc::new(LlmRouter::new());
    router.register("main", provider);
    let store = Arc::new(Store::open_in_memory().unwrap());
    let runtime = Arc::new(AgentRuntime::new(router, store.clone()));
    ExecutionEngine::new(ExecutionConfig::default(), runtime, store)
}

#[tokio::test]
async fn diamond_runs_in_dependency_order() {
    let provider = Arc::new(MockProvider::with_replies([
        "a output",
        "b output",
        "c output",
        "d output",
    ]));
    let engine = engine_with_provider(provider.clone());

    let record = engine.start(&diamond_plan()).await.unwrap();
    assert_eq!(record.state, ExecutionState::Running);
    let ready: Vec<_> = record
        .tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Ready)
        .map(|t| t.task_id.as_str())
        .collect();
    assert_eq!(ready, vec!["a"]);

    let record = engine.tick(&record.execution_id).await.unwrap();
    let a = record.tasks.iter().find(|t| t.task_id == "a").unwrap();
    assert_eq!(a.status, TaskStatus::Completed);
    assert_eq!(a.output.as_deref(), Some("a output"));
    // a done -> b and c both ready.
    let ready: Vec<_> = record
        .tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Ready)
        .map(|t| t.task_id.as_str())
        .collect();
    assert_eq!(ready, vec!["b", "c"]);

    let record = engine.run(&record.execution_id, 10).await.unwrap();
    assert_eq!(record.state, ExecutionState::Completed);
    assert!(record.tasks.iter().all(|t| t.status == TaskStatus::Completed));

    // The synthesizing task saw its upstream outputs.
    let prompts = provider.recorded_prompts();
    let d_prompt = prompts.last().unwrap();
    assert!(d_prompt.contains("b output"));
    assert!(d_prompt.contains("c output"));
}

#[tokio::test]
async fn cancel_finalizes_open_tasks_and_ticks_become_noops() {
    let provider = Arc::new(MockProvider::with_replies(["a output", "b output"]));
    let engine = engine_with_provider(provider);

    let record = engine.start(&diamond_plan()).await.unwrap();
    let id = record.execution_id.clone();
    engine.tick(&id).await.unwrap(); // a
    engine.tick(&id).await.unwrap(); // b

    let record = engine.cancel(&id).await.unwrap();
    assert_eq!(record.state, ExecutionState::Cancelled);
    for task_id in ["c", "d"] {
        let task = record.tasks.iter().find(|t| t.task_id == task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.last_error.as_deref(), Some("CANCELLED"));
    }
    // a and b keep their completed state.
    assert_eq!(
        record
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .count(),
        2
    );

    let before = record.cursor_index;
    let after = engine.tick(&id).await.unwrap();
    assert_eq!(after.state, ExecutionState::Cancelled);
    assert_eq!(after.cursor_index, before);
}

#[tokio::test]
async fn complete_action_is_idempotent() {
    let provider = Arc::new(MockProvider::new());
    let engine = engine_with_provider(provider);
    let record = engine.start(&diamond_plan()).await.unwrap();
    let id = record.execution_id.clone();

    let first = engine
        .task_action(&id, "a", TaskAction::Complete, Some("done by hand"))
        .await
        .unwrap();
    let a = first.tasks.iter().find(|t| t.task_id == "a").unwrap();
    assert_eq!(a.status, TaskStatus::Completed);
    assert_eq!(a.output.as_deref(), Some("done by hand"));

    let second = engine
        .task_action(&id, "a", TaskAction::Complete, Some("different note"))
        .await
        .unwrap();
    let a2 = second.tasks.iter().find(|t| t.task_id == "a").unwrap();
    // No-op: the original output survives.
    assert_eq!(a2.output.as_deref(), Some("done by hand"));
}

#[tokio::test]
async fn skipping_a_non_skippable_dependency_fails_downstream() {
    let provider = Arc::new(MockProvider::new());
    let engine = engine_with_provider(provider);
    let record = engine.start(&diamond_plan()).await.unwrap();
    let id = record.execution_id.clone();

    engine
        .task_action(&id, "a", TaskAction::Complete, None)
        .await
        .unwrap();
    // b is not skippable: d must fail with UPSTREAM_SKIPPED.
    engine
        .task_action(&id, "b", TaskAction::Skip, None)
        .await
        .unwrap();
    let record = engine
        .task_action(&id, "c", TaskAction::Complete, None)
        .await
        .unwrap();

    let d = record.tasks.iter().find(|t| t.task_id == "d").unwrap();
    assert_eq!(d.status, TaskStatus::Failed);
    assert_eq!(d.last_error.as_deref(), Some("UPSTREAM_SKIPPED"));
    assert_eq!(record.state, ExecutionState::Failed);
}

#[tokio::test]
async fn skippable_task_counts_as_completed_with_empty_output() {
    let provider = Arc::new(MockProvider::with_replies(["a", "b", "d"]));
    let engine = engine_with_provider(provider);
    let record = engine.start(&diamond_plan()).await.unwrap();
    let id = record.execution_id.clone();

    engine.tick(&id).await.unwrap(); // a
    engine.tick(&id).await.unwrap(); // b
    // c is skippable.
    engine
        .task_action(&id, "c", TaskAction::Skip, None)
        .await
        .unwrap();
    let record = engine.run(&id, 5).await.unwrap();
    assert_eq!(record.state, ExecutionState::Completed);
    let d = record.tasks.iter().find(|t| t.task_id == "d").unwrap();
    assert_eq!(d.status, TaskStatus::Completed);
}

#[tokio::test]
async fn failed_task_retries_then_exhausts() {
    let provider = Arc::new(MockProvider::new());
    // Three protocol failures: attempts 1..=3 all fail, task stays failed.
    for _ in 0..3 {
        provider.push_failure(EngineError::LlmProtocol("garbled".to_string()));
    }
    let engine = engine_with_provider(provider);

    let plan = Plan {
        tasks: vec![plan_task("only", &[], false)],
        edges: Vec::new(),
        ..diamond_plan()
    };
    let record = engine.start(&plan).await.unwrap();
    let id = record.execution_id.clone();

    let record = engine.run(&id, 10).await.unwrap();
    let task = record.tasks.iter().find(|t| t.task_id == "only").unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.attempts, 3);
    assert_eq!(record.state, ExecutionState::Failed);

    // Operator retry after exhaustion is refused.
    let err = engine
        .task_action(&id, "only", TaskAction::Retry, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn approval_marker_blocks_task_and_execution() {
    let provider = Arc::new(MockProvider::with_replies(["AWAITING_APPROVAL"]));
    let engine = engine_with_provider(provider);

    let plan = Plan {
        tasks: vec![plan_task("approval", &[], false)],
        edges: Vec::new(),
        ..diamond_plan()
    };
    let record = engine.start(&plan).await.unwrap();
    let id = record.execution_id.clone();

    let record = engine.tick(&id).await.unwrap();
    let task = record.tasks.iter().find(|t| t.task_id == "approval").unwrap();
    assert_eq!(task.status, TaskStatus::Blocked);
    assert_eq!(record.state, ExecutionState::Blocked);

    // Operator approval completes the task and the execution.
    let record = engine
        .task_action(&id, "approval", TaskAction::Complete, Some("approved"))
        .await
        .unwrap();
    assert_eq!(record.state, ExecutionState::Completed);
}

#[tokio::test]
async fn unknown_execution_is_not_found() {
    let provider = Arc::new(MockProvider::new());
    let engine = engine_with_provider(provider);
    let err = engine.tick("missing").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}
