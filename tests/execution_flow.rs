//! Plan-and-execute flow through the public facade: rule-driven planning,
//! A2A execution, operator actions and cancellation.

use std::sync::Arc;

use anyhow::Result;
use datapilot::core::execution::{ExecutionState, TaskAction, TaskStatus};
use datapilot::core::llm::MockProvider;
use datapilot::core::planning::LoanType;
use datapilot::core::types::Scene;
use datapilot::{EngineConfig, Services};

fn engine() -> Result<(Services, Arc<MockProvider>)> {
    let services = Services::in_memory(EngineConfig::default())?;
    let provider = Arc::new(MockProvider::new());
    services.llm().register("main", provider.clone());
    Ok((services, provider))
}

#[tokio::test]
async fn question_to_completed_execution() -> Result<()> {
    let (services, provider) = engine()?;
    for reply in ["指标拆解 done", "风险评估 done", "策略建议 done"] {
        provider.push_reply(reply);
    }

    let record = services
        .start_execution(
            None,
            Some("为什么经营贷逾期率上升"),
            Scene::LoanOps,
            None,
        )
        .await?;
    assert_eq!(record.state, ExecutionState::Running);
    assert_eq!(record.tasks.len(), 3);
    assert_eq!(record.loan_type, Some(LoanType::Business));

    let finished = services.run_execution(&record.execution_id, 10).await?;
    assert_eq!(finished.state, ExecutionState::Completed);
    assert!(finished.tasks.iter().all(|t| t.status == TaskStatus::Completed));

    // Later tasks saw the upstream outputs in their prompts.
    let prompts = provider.recorded_prompts();
    assert!(prompts.last().unwrap().contains("指标拆解 done"));
    Ok(())
}

#[tokio::test]
async fn prebuilt_plan_can_be_started_by_id() -> Result<()> {
    let (services, provider) = engine()?;
    provider.push_reply("step done");

    let plan = services
        .build_plan("overdue risk deep dive", Scene::LoanOps, Some(LoanType::Mixed))
        .await?;
    let record = services
        .start_execution(Some(&plan.id), None, Scene::LoanOps, None)
        .await?;
    assert_eq!(record.plan_id, plan.id);

    let after = services.tick_execution(&record.execution_id).await?;
    let first = after
        .tasks
        .iter()
        .find(|t| t.task_id == "task_1")
        .unwrap();
    assert_eq!(first.status, TaskStatus::Completed);
    assert_eq!(first.output.as_deref(), Some("step done"));
    Ok(())
}

#[tokio::test]
async fn cancellation_is_final() -> Result<()> {
    let (services, provider) = engine()?;
    provider.push_reply("first task done");

    let record = services
        .start_execution(None, Some("逾期归因分析"), Scene::LoanOps, None)
        .await?;
    let id = record.execution_id.clone();

    services.tick_execution(&id).await?;
    let cancelled = services.cancel_execution(&id).await?;
    assert_eq!(cancelled.state, ExecutionState::Cancelled);
    assert!(cancelled.tasks.iter().any(|t| {
        t.status == TaskStatus::Failed && t.last_error.as_deref() == Some("CANCELLED")
    }));

    // Ticking a cancelled execution is a no-op.
    let after = services.tick_execution(&id).await?;
    assert_eq!(after.state, ExecutionState::Cancelled);
    assert_eq!(after.cursor_index, cancelled.cursor_index);
    Ok(())
}

#[tokio::test]
async fn operator_can_drive_tasks_manually() -> Result<()> {
    let (services, _provider) = engine()?;

    let record = services
        .start_execution(None, Some("consumer conversion 转化分析"), Scene::DataDiscuss, None)
        .await?;
    let id = record.execution_id.clone();
    let first_task = record.tasks[0].task_id.clone();

    let after = services
        .execution_task_action(&id, &first_task, TaskAction::Complete, Some("manual result"))
        .await?;
    let task = after.tasks.iter().find(|t| t.task_id == first_task).unwrap();
    assert_eq!(task.status, TaskStatus::Completed);

    // Completing every remaining task finishes the execution.
    let mut current = after;
    loop {
        let next = current
            .tasks
            .iter()
            .find(|t| matches!(t.status, TaskStatus::Ready | TaskStatus::Pending))
            .map(|t| t.task_id.clone());
        match next {
            Some(task_id) => {
                current = services
                    .execution_task_action(&id, &task_id, TaskAction::Complete, None)
                    .await?;
            }
            None => break,
        }
    }
    assert_eq!(current.state, ExecutionState::Completed);
    Ok(())
}

#[tokio::test]
async fn validation_requires_plan_or_question() -> Result<()> {
    let (services, _provider) = engine()?;
    let err = services
        .start_execution(None, None, Scene::DataDiscuss, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), datapilot::ErrorKind::Validation);
    Ok(())
}
