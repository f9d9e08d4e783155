//! Drives executions: materializes a plan, advances the ready frontier one
//! task per tick, applies operator actions, and finalizes cancellation.
//!
//! All transitions for one execution are serialized by its mutex; lookups in
//! the registry never block a tick of another execution.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ExecutionConfig;
use crate::core::agents::{AgentProfile, AgentRuntime, prompts};
use crate::core::error::EngineError;
use crate::core::planning::Plan;
use crate::core::store::Store;
use crate::core::types::{AgentMessage, StepLog, now_iso};

use super::types::{ExecutionRecord, ExecutionState, TaskSnapshot, TaskStatus};
use super::{execution_can_transition, task_can_transition};

const TASK_LLM_TIMEOUT_MS: u64 = 60_000;
const TASK_OUTPUT_MAX_CHARS: usize = 8_000;
const RETRY_BACKOFF_BASE_MS: u64 = 500;
const BLOCKED_MARKER: &str = "AWAITING_APPROVAL";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskAction {
    Start,
    Complete,
    Fail,
    Retry,
    Skip,
}

impl TaskAction {
    pub fn from_str_tag(value: &str) -> Option<Self> {
        match value {
            "start" => Some(TaskAction::Start),
            "complete" => Some(TaskAction::Complete),
            "fail" => Some(TaskAction::Fail),
            "retry" => Some(TaskAction::Retry),
            "skip" => Some(TaskAction::Skip),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            TaskAction::Start => "start",
            TaskAction::Complete => "complete",
            TaskAction::Fail => "fail",
            TaskAction::Retry => "retry",
            TaskAction::Skip => "skip",
        }
    }
}

struct ExecutionHandle {
    record: Mutex<ExecutionRecord>,
    cancel: CancellationToken,
}

pub struct ExecutionEngine {
    cfg: ExecutionConfig,
    runtime: Arc<AgentRuntime>,
    store: Arc<Store>,
    registry: RwLock<HashMap<String, Arc<ExecutionHandle>>>,
}

impl ExecutionEngine {
    pub fn new(cfg: ExecutionConfig, runtime: Arc<AgentRuntime>, store: Arc<Store>) -> Self {
        Self {
            cfg,
            runtime,
            store,
            registry: RwLock::new(HashMap::new()),
        }
    }

    /// Materialize a plan into a running execution.
    pub async fn start(&self, plan: &Plan) -> Result<ExecutionRecord, EngineError> {
        let now = now_iso();
        let tasks: Vec<TaskSnapshot> = plan
            .tasks
            .iter()
            .map(|task| TaskSnapshot {
                task_id: task.task_id.clone(),
                title: task.title.clone(),
                objective: task.objective.clone(),
                assigned_agent: task.assigned_agent.clone(),
                depends_on: task.depends_on.clone(),
                skippable: task.skippable,
                status: TaskStatus::Pending,
                attempts: 0,
                started_at: None,
                finished_at: None,
                output: None,
                last_error: None,
            })
            .collect();

        let mut record = ExecutionRecord {
            execution_id: Uuid::new_v4().to_string(),
            plan_id: plan.id.clone(),
            question: plan.question.clone(),
            scene: plan.scene,
            loan_type: Some(plan.loan_type),
            workflow_mode: plan.workflow_mode.clone(),
            state: ExecutionState::Created,
            tasks,
            cursor_index: 0,
            created_at: now.clone(),
            updated_at: now.clone(),
            started_at: Some(now),
            finished_at: None,
            result_summary: None,
        };
        refresh_ready(&mut record);
        record.state = ExecutionState::Running;

        let handle = Arc::new(ExecutionHandle {
            record: Mutex::new(record.clone()),
            cancel: CancellationToken::new(),
        });
        self.registry
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(record.execution_id.clone(), handle);

        self.persist(&record).await;
        self.log(
            &record.execution_id,
            "execution_start",
            "success",
            format!("A2A execution created with {} tasks", record.tasks.len()),
        )
        .await;
        info!(execution_id = %record.execution_id, plan_id = %plan.id, "execution started");
        Ok(record)
    }

    pub async fn get(&self, execution_id: &str) -> Result<ExecutionRecord, EngineError> {
        let handle = self.handle(execution_id).await?;
        let record = handle.record.lock().await;
        Ok(record.clone())
    }

    pub async fn list(&self, limit: usize) -> Result<Vec<ExecutionRecord>, EngineError> {
        let snapshots = self.store.list_execution_snapshots(limit).await?;
        let mut records = Vec::with_capacity(snapshots.len());
        for snapshot in snapshots {
            records.push(serde_json::from_str(&snapshot)?);
        }
        Ok(records)
    }

    /// Advance one step: run the lexicographically smallest ready task to a
    /// terminal or blocked state. A no-op on terminal executions.
    pub async fn tick(&self, execution_id: &str) -> Result<ExecutionRecord, EngineError> {
        let handle = self.handle(execution_id).await?;
        let mut guard = handle.record.lock().await;
        let mut record = &mut *guard;
        if record.state.is_terminal() {
            return Ok(record.clone());
        }
        if handle.cancel.is_cancelled() {
            finalize_cancel(record);
            self.persist(record).await;
            return Ok(record.clone());
        }

        refresh_ready(record);
        let next = record
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Ready)
            .map(|t| t.task_id.clone())
            .min();

        let Some(task_id) = next else {
            recompute_state(&mut record);
            self.persist(&record).await;
            return Ok(record.clone());
        };

        let (agent, user_prompt) = {
            let prior: Vec<(String, String)> = record
                .tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Completed)
                .filter_map(|t| t.output.clone().map(|o| (t.task_id.clone(), o)))
                .collect();
            let task = record
                .tasks
                .iter_mut()
                .find(|t| t.task_id == task_id)
                .ok_or_else(|| EngineError::internal("ready task vanished"))?;
            task.status = TaskStatus::Running;
            task.attempts += 1;
            task.started_at.get_or_insert_with(now_iso);
            (
                task.assigned_agent.clone(),
                prompts::task_user_prompt(&task.title, &task.objective, &record.question, &prior),
            )
        };
        record.cursor_index += 1;
        self.log(
            execution_id,
            "task_start",
            "success",
            format!("{task_id} -> running ({agent})"),
        )
        .await;

        let profile = AgentProfile::named(agent);
        let outcome = tokio::select! {
            _ = handle.cancel.cancelled() => Err(EngineError::Cancelled),
            result = self.runtime.invoke(
                &profile,
                record.scene,
                "task_run",
                prompts::TASK_SYSTEM_PROMPT,
                &user_prompt,
                TASK_LLM_TIMEOUT_MS,
            ) => result,
        };

        match outcome {
            Ok(message) => {
                let blocked = reply_implies_block(&message);
                let task = task_mut(&mut record, &task_id)?;
                if blocked {
                    task.status = TaskStatus::Blocked;
                    self.log(
                        execution_id,
                        "task_blocked",
                        "success",
                        format!("{task_id} awaits external approval"),
                    )
                    .await;
                } else {
                    task.status = TaskStatus::Completed;
                    task.finished_at = Some(now_iso());
                    task.output = Some(clip(&message.content, TASK_OUTPUT_MAX_CHARS));
                    task.last_error = None;
                    self.log(
                        execution_id,
                        "task_complete",
                        "success",
                        format!("{task_id} -> completed"),
                    )
                    .await;
                }
            }
            Err(EngineError::Cancelled) => {
                finalize_cancel(&mut record);
                self.persist(&record).await;
                self.log(execution_id, "task_cancelled", "success", task_id.clone())
                    .await;
                return Ok(record.clone());
            }
            Err(e) => {
                let max_attempts = self.cfg.max_attempts_per_task;
                let backoff_cap = self.cfg.retry_backoff_cap_ms;
                let task = task_mut(&mut record, &task_id)?;
                task.last_error = Some(e.to_string());
                if task.attempts < max_attempts {
                    // Back off with full jitter, then hand the task back to
                    // the ready frontier.
                    let exp = RETRY_BACKOFF_BASE_MS
                        .saturating_mul(2u64.saturating_pow(task.attempts.saturating_sub(1)));
                    let capped = exp.min(backoff_cap);
                    let jittered = rand::thread_rng().gen_range(0..=capped);
                    let sleep = Duration::from_millis(jittered);
                    task.status = TaskStatus::Failed;
                    let attempts = task.attempts;
                    self.log(
                        execution_id,
                        "task_retry",
                        "error",
                        format!("{task_id} failed (attempt {attempts}), retrying: {e}"),
                    )
                    .await;
                    tokio::select! {
                        _ = handle.cancel.cancelled() => {
                            finalize_cancel(&mut record);
                            self.persist(&record).await;
                            return Ok(record.clone());
                        }
                        _ = tokio::time::sleep(sleep) => {}
                    }
                    task_mut(&mut record, &task_id)?.status = TaskStatus::Ready;
                } else {
                    task.status = TaskStatus::Failed;
                    task.finished_at = Some(now_iso());
                    self.log(
                        execution_id,
                        "task_fail",
                        "error",
                        format!("{task_id} exhausted attempts: {e}"),
                    )
                    .await;
                }
            }
        }

        refresh_ready(&mut record);
        recompute_state(&mut record);
        self.persist(&record).await;
        Ok(record.clone())
    }

    /// Tick until terminal or the step budget runs out.
    pub async fn run(
        &self,
        execution_id: &str,
        max_steps: u32,
    ) -> Result<ExecutionRecord, EngineError> {
        let steps = max_steps.clamp(1, self.cfg.step_cap);
        let mut record = self.get(execution_id).await?;
        for _ in 0..steps {
            if record.state.is_terminal() {
                break;
            }
            record = self.tick(execution_id).await?;
        }
        Ok(record)
    }

    /// Operator override on a single task.
    pub async fn task_action(
        &self,
        execution_id: &str,
        task_id: &str,
        action: TaskAction,
        note: Option<&str>,
    ) -> Result<ExecutionRecord, EngineError> {
        let handle = self.handle(execution_id).await?;
        let mut record = handle.record.lock().await;
        if record.state.is_terminal() {
            // Idempotent completes still return the same snapshot.
            if action == TaskAction::Complete
                && record
                    .tasks
                    .iter()
                    .any(|t| t.task_id == task_id && t.status == TaskStatus::Completed)
            {
                return Ok(record.clone());
            }
            return Err(EngineError::Conflict(format!(
                "execution is {}, no further actions",
                record.state.as_str()
            )));
        }

        let max_attempts = self.cfg.max_attempts_per_task;
        {
            let deps_done = deps_satisfied(&record, task_id)?;
            let task = task_mut(&mut record, task_id)?;
            match action {
                TaskAction::Start => {
                    if !deps_done {
                        return Err(EngineError::ExecutionBlocked(
                            "dependencies not completed".to_string(),
                        ));
                    }
                    require_transition(task, TaskStatus::Running)?;
                    task.status = TaskStatus::Running;
                    task.attempts += 1;
                    task.started_at.get_or_insert_with(now_iso);
                    task.last_error = None;
                }
                TaskAction::Complete => {
                    // Idempotent: completing a completed task is a no-op.
                    if task.status != TaskStatus::Completed {
                        require_transition(task, TaskStatus::Completed)?;
                        task.status = TaskStatus::Completed;
                        task.finished_at = Some(now_iso());
                        task.output = Some(
                            note.map(|n| n.to_string())
                                .unwrap_or_else(|| format!("{} completed", task.title)),
                        );
                        task.last_error = None;
                    }
                }
                TaskAction::Fail => {
                    require_transition(task, TaskStatus::Failed)?;
                    task.status = TaskStatus::Failed;
                    task.finished_at = Some(now_iso());
                    task.last_error = Some(note.unwrap_or("task failed").to_string());
                }
                TaskAction::Retry => {
                    if task.status != TaskStatus::Failed {
                        return Err(EngineError::Conflict(
                            "only a failed task can be retried".to_string(),
                        ));
                    }
                    if task.attempts >= max_attempts {
                        return Err(EngineError::Conflict(format!(
                            "task exhausted its {max_attempts} attempts"
                        )));
                    }
                    task.status = TaskStatus::Ready;
                    task.finished_at = None;
                    task.last_error = None;
                }
                TaskAction::Skip => {
                    require_transition(task, TaskStatus::Skipped)?;
                    task.status = TaskStatus::Skipped;
                    task.finished_at = Some(now_iso());
                    task.output = Some(note.unwrap_or("task skipped").to_string());
                }
            }
        }

        refresh_ready(&mut record);
        recompute_state(&mut record);
        self.persist(&record).await;
        self.log(
            execution_id,
            &format!("task_{}", action.as_str()),
            "success",
            format!("{task_id} -> {}", action.as_str()),
        )
        .await;
        Ok(record.clone())
    }

    /// Mark the execution cancelled. A tick in flight aborts at its next
    /// suspension point; every non-terminal task finalizes as
    /// `failed[CANCELLED]`.
    pub async fn cancel(&self, execution_id: &str) -> Result<ExecutionRecord, EngineError> {
        let handle = self.handle(execution_id).await?;
        handle.cancel.cancel();
        let mut record = handle.record.lock().await;
        if !record.state.is_terminal() {
            finalize_cancel(&mut record);
            self.persist(&record).await;
            self.log(execution_id, "execution_cancel", "success", String::new())
                .await;
        }
        Ok(record.clone())
    }

    async fn handle(&self, execution_id: &str) -> Result<Arc<ExecutionHandle>, EngineError> {
        if let Some(handle) = self
            .registry
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(execution_id)
        {
            return Ok(handle.clone());
        }
        // Fall back to the store (e.g. after a restart) and re-register.
        let snapshot = self
            .store
            .get_execution_snapshot(execution_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("execution {execution_id}")))?;
        let record: ExecutionRecord = serde_json::from_str(&snapshot)?;
        let handle = Arc::new(ExecutionHandle {
            record: Mutex::new(record),
            cancel: CancellationToken::new(),
        });
        self.registry
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(execution_id.to_string(), handle.clone());
        Ok(handle)
    }

    async fn persist(&self, record: &ExecutionRecord) {
        let mut record = record.clone();
        record.updated_at = now_iso();
        match serde_json::to_string(&record) {
            Ok(snapshot) => {
                if let Err(e) = self
                    .store
                    .save_execution(&record.execution_id, record.state.as_str(), &snapshot)
                    .await
                {
                    warn!(execution_id = %record.execution_id, error = %e, "failed to persist execution");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize execution snapshot"),
        }
    }

    async fn log(&self, execution_id: &str, step: &str, status: &str, detail: String) {
        let log = StepLog {
            execution_id: Some(execution_id.to_string()),
            profile_id: None,
            step: step.to_string(),
            status: status.to_string(),
            detail,
            metadata: serde_json::Value::Null,
            ts: now_iso(),
        };
        if let Err(e) = self.store.append_step_log(&log).await {
            warn!(execution_id, error = %e, "failed to append execution log");
        }
    }
}

fn clip(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let clipped: String = text.chars().take(max_chars).collect();
        format!("{clipped}...")
    }
}

fn reply_implies_block(message: &AgentMessage) -> bool {
    if message.content.contains(BLOCKED_MARKER) {
        return true;
    }
    message
        .metadata
        .get("await_approval")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

fn task_mut<'a>(
    record: &'a mut ExecutionRecord,
    task_id: &str,
) -> Result<&'a mut TaskSnapshot, EngineError> {
    record
        .tasks
        .iter_mut()
        .find(|t| t.task_id == task_id)
        .ok_or_else(|| EngineError::NotFound(format!("task {task_id}")))
}

fn deps_satisfied(record: &ExecutionRecord, task_id: &str) -> Result<bool, EngineError> {
    let task = record
        .tasks
        .iter()
        .find(|t| t.task_id == task_id)
        .ok_or_else(|| EngineError::NotFound(format!("task {task_id}")))?;
    Ok(task.depends_on.iter().all(|dep| {
        record
            .tasks
            .iter()
            .find(|t| &t.task_id == dep)
            .map(|t| {
                t.status == TaskStatus::Completed
                    || (t.status == TaskStatus::Skipped && t.skippable)
            })
            .unwrap_or(false)
    }))
}

fn require_transition(task: &TaskSnapshot, to: TaskStatus) -> Result<(), EngineError> {
    if task_can_transition(task.status, to) {
        Ok(())
    } else {
        Err(EngineError::Conflict(format!(
            "task {} cannot move {} -> {}",
            task.task_id,
            task.status.as_str(),
            to.as_str()
        )))
    }
}

/// Promote pending tasks whose dependencies are satisfied; fail dependents of
/// non-skippable skipped tasks.
fn refresh_ready(record: &mut ExecutionRecord) {
    let statuses: HashMap<String, (TaskStatus, bool)> = record
        .tasks
        .iter()
        .map(|t| (t.task_id.clone(), (t.status, t.skippable)))
        .collect();

    for task in &mut record.tasks {
        if task.status != TaskStatus::Pending {
            continue;
        }
        let mut upstream_skipped = false;
        let all_done = task.depends_on.iter().all(|dep| {
            match statuses.get(dep) {
                Some((TaskStatus::Completed, _)) => true,
                Some((TaskStatus::Skipped, true)) => true,
                Some((TaskStatus::Skipped, false)) => {
                    upstream_skipped = true;
                    false
                }
                _ => false,
            }
        });
        if upstream_skipped {
            task.status = TaskStatus::Failed;
            task.finished_at = Some(now_iso());
            task.last_error = Some("UPSTREAM_SKIPPED".to_string());
        } else if all_done {
            task.status = TaskStatus::Ready;
        }
    }
}

fn recompute_state(record: &mut ExecutionRecord) {
    if record.state.is_terminal() {
        return;
    }
    let all_done = record.tasks.iter().all(|t| t.status.is_terminal());
    let any_failed = record.tasks.iter().any(|t| t.status == TaskStatus::Failed);
    let any_ready_or_running = record
        .tasks
        .iter()
        .any(|t| matches!(t.status, TaskStatus::Ready | TaskStatus::Running));
    let any_blocked = record.tasks.iter().any(|t| t.status == TaskStatus::Blocked);

    let next = if all_done {
        record.finished_at = Some(now_iso());
        record.result_summary = Some("All tasks finished".to_string());
        ExecutionState::Completed
    } else if any_failed && !any_ready_or_running {
        ExecutionState::Failed
    } else if any_blocked && !any_ready_or_running {
        ExecutionState::Blocked
    } else {
        ExecutionState::Running
    };

    if execution_can_transition(record.state, next) {
        record.state = next;
    }
}

fn finalize_cancel(record: &mut ExecutionRecord) {
    for task in &mut record.tasks {
        if !task.status.is_terminal() {
            task.status = TaskStatus::Failed;
            task.finished_at = Some(now_iso());
            task.last_error = Some("CANCELLED".to_string());
        }
    }
    record.state = ExecutionState::Cancelled;
    record.finished_at = Some(now_iso());
}
