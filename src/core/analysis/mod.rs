//! The analysis pipeline: resolve datasource, summarize schema, draft SQL,
//! validate, execute, and recover from SQL errors through a bounded
//! correction loop.

pub mod validate;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::AnalyzeConfig;
use crate::core::agents::{AgentProfile, SchemaAgent, SqlAgent, VisualizeAgent, visualize};
use crate::core::db::pool::PoolManager;
use crate::core::db::{QueryOptions, QueryOutput};
use crate::core::error::EngineError;
use crate::core::memory::{MemoryEventType, MemoryStore};
use crate::core::store::Store;
use crate::core::types::{
    AnalysisRequest, AnalysisResult, CorrectionRecord, Datasource, MessageIntent, QueryRecord,
    QueryStatus, now_iso,
};

const LLM_TIMEOUT_MS: u64 = 60_000;
const MEMORY_CONTEXT_HITS: usize = 6;
const PROFILES_KEY: &str = "agent_profiles";

pub struct AnalysisPipeline {
    cfg: AnalyzeConfig,
    pool: Arc<PoolManager>,
    store: Arc<Store>,
    memory: Arc<MemoryStore>,
    schema_agent: Arc<SchemaAgent>,
    sql_agent: Arc<SqlAgent>,
    visualize_agent: Arc<VisualizeAgent>,
}

impl AnalysisPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: AnalyzeConfig,
        pool: Arc<PoolManager>,
        store: Arc<Store>,
        memory: Arc<MemoryStore>,
        schema_agent: Arc<SchemaAgent>,
        sql_agent: Arc<SqlAgent>,
        visualize_agent: Arc<VisualizeAgent>,
    ) -> Self {
        Self {
            cfg,
            pool,
            store,
            memory,
            schema_agent,
            sql_agent,
            visualize_agent,
        }
    }

    /// End-to-end entry point. The whole pipeline runs under the configured
    /// cap; cancellation aborts at the next suspension point.
    pub async fn analyze(
        &self,
        request: &AnalysisRequest,
        cancel: CancellationToken,
    ) -> Result<AnalysisResult, EngineError> {
        let deadline = Duration::from_millis(self.cfg.end_to_end_timeout_ms);
        tokio::select! {
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
            outcome = tokio::time::timeout(deadline, self.run(request)) => match outcome {
                Ok(result) => result,
                Err(_) => Err(EngineError::Timeout(format!(
                    "analyze exceeded {}ms", self.cfg.end_to_end_timeout_ms
                ))),
            },
        }
    }

    async fn run(&self, request: &AnalysisRequest) -> Result<AnalysisResult, EngineError> {
        let started = Instant::now();
        let query_id = Uuid::new_v4().to_string();
        info!(%query_id, question = %request.question, scene = request.scene.as_str(), "analyze started");

        let datasource = self.resolve_datasource(request).await?;
        let defaults = request.scene.defaults();
        let profile = self.resolve_profile(request).await?;

        let schema = self
            .schema_agent
            .relevant_schema(&datasource, Some(&request.question))
            .await?;

        let memory_context = self
            .memory
            .build_context(&request.question, MEMORY_CONTEXT_HITS, Some(request.scene))
            .await
            .unwrap_or_default();

        let draft = self
            .sql_agent
            .draft(
                &profile,
                request.scene,
                &request.question,
                &schema,
                &memory_context,
                LLM_TIMEOUT_MS,
            )
            .await?;

        if draft.intent == MessageIntent::Clarification {
            // Permissive fallback: a clarification without the structured
            // payload still carries its question as plain content.
            let clarification = draft.clarification.clone().unwrap_or_else(|| {
                crate::core::types::Clarification {
                    question: draft.raw.content.clone(),
                    options: Vec::new(),
                }
            });
            self.record_memory(request, None, "clarification requested")
                .await;
            return Ok(AnalysisResult {
                intent: MessageIntent::Clarification,
                sql: None,
                columns: None,
                rows: None,
                row_count: None,
                duration_ms: started.elapsed().as_millis() as u64,
                insight: None,
                clarification: Some(clarification),
                chart: None,
                attempts: 0,
                errors: Vec::new(),
                answer: None,
            });
        }

        let Some(draft_sql) = draft.sql.clone() else {
            // Small talk: the agent answered directly without SQL.
            if let Some(answer) = draft.answer.clone() {
                return Ok(AnalysisResult {
                    intent: MessageIntent::Answer,
                    sql: None,
                    columns: None,
                    rows: None,
                    row_count: None,
                    duration_ms: started.elapsed().as_millis() as u64,
                    insight: None,
                    clarification: None,
                    chart: None,
                    attempts: 0,
                    errors: Vec::new(),
                    answer: Some(answer),
                });
            }
            return Err(EngineError::LlmProtocol(
                "provider returned neither SQL nor a direct answer".to_string(),
            ));
        };

        let mut current_sql = validate::validate(&draft_sql, defaults.read_only)?;
        let opts = QueryOptions {
            timeout_ms: defaults.timeout_ms,
            max_rows: defaults.max_rows,
        };

        let mut attempts: u32 = 0;
        let mut errors: Vec<String> = Vec::new();
        // (attempt, original, error, corrected) awaiting its re-execution
        // outcome before it gets logged.
        let mut pending: Option<(u32, String, String, String)> = None;

        let outcome: Result<QueryOutput, EngineError> = loop {
            attempts += 1;
            let executed_sql = validate::apply_row_limit(&current_sql, defaults.max_rows);
            let exec_result = {
                let mut conn = self.pool.acquire(&datasource).await?;
                conn.execute(&executed_sql, &opts).await
            };

            match exec_result {
                Ok(output) => {
                    if let Some((attempt, original, error, corrected)) = pending.take() {
                        self.log_correction(&query_id, attempt, &original, &error, Some(&corrected), true)
                            .await;
                    }
                    break Ok(output);
                }
                Err(EngineError::SqlError(engine_error)) => {
                    warn!(%query_id, attempt = attempts, error = %engine_error, "SQL failed");
                    errors.push(engine_error.clone());
                    if let Some((attempt, original, error, corrected)) = pending.take() {
                        self.log_correction(&query_id, attempt, &original, &error, Some(&corrected), false)
                            .await;
                    }
                    if attempts > self.cfg.max_correction_attempts {
                        break Err(EngineError::SqlError(engine_error));
                    }

                    let correction = self
                        .sql_agent
                        .correct(
                            &profile,
                            request.scene,
                            &request.question,
                            &schema,
                            &current_sql,
                            &engine_error,
                            LLM_TIMEOUT_MS,
                        )
                        .await;

                    let corrected_sql = match correction {
                        Ok(c) => c.sql,
                        Err(e) => {
                            warn!(%query_id, error = %e, "correction call failed");
                            None
                        }
                    };

                    let Some(corrected_raw) = corrected_sql else {
                        self.log_correction(&query_id, attempts, &current_sql, &engine_error, None, false)
                            .await;
                        break Err(EngineError::SqlError(engine_error));
                    };
                    let corrected = match validate::validate(&corrected_raw, defaults.read_only) {
                        Ok(sql) => sql,
                        Err(e) => {
                            self.log_correction(
                                &query_id,
                                attempts,
                                &current_sql,
                                &engine_error,
                                Some(&corrected_raw),
                                false,
                            )
                            .await;
                            warn!(%query_id, error = %e, "corrected SQL failed validation");
                            break Err(EngineError::SqlError(engine_error));
                        }
                    };

                    // Fixed point: the agent repeated itself, stop here.
                    if corrected == current_sql {
                        self.log_correction(
                            &query_id,
                            attempts,
                            &current_sql,
                            &engine_error,
                            Some(&corrected),
                            false,
                        )
                        .await;
                        break Err(EngineError::SqlError(engine_error));
                    }

                    pending = Some((attempts, current_sql.clone(), engine_error, corrected.clone()));
                    current_sql = corrected;
                }
                Err(other) => break Err(other),
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(output) => {
                self.record_query(&query_id, &datasource, &current_sql, &output, None)
                    .await;
                self.record_memory(
                    request,
                    Some(&current_sql),
                    &format!("returned {} rows", output.row_count),
                )
                .await;

                let wants_chart = request.visualize || draft.should_visualize;
                let (chart, insight) = if wants_chart
                    && visualize::worth_charting(&output.columns, &output.rows)
                {
                    match self
                        .visualize_agent
                        .chart(
                            &profile,
                            request.scene,
                            &request.question,
                            &output.columns,
                            &output.rows,
                            LLM_TIMEOUT_MS,
                        )
                        .await
                    {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(%query_id, error = %e, "visualization failed, returning data only");
                            (None, None)
                        }
                    }
                } else {
                    (None, None)
                };

                info!(%query_id, attempts, rows = output.row_count, duration_ms, "analyze succeeded");
                Ok(AnalysisResult {
                    intent: MessageIntent::Answer,
                    sql: Some(current_sql),
                    columns: Some(output.columns),
                    row_count: Some(output.rows.len()),
                    rows: Some(output.rows),
                    duration_ms,
                    insight,
                    clarification: None,
                    chart,
                    attempts,
                    errors,
                    answer: None,
                })
            }
            Err(EngineError::SqlError(final_error)) => {
                // Surface the correction trail instead of a bare failure so
                // operators can inspect what was tried.
                self.record_query_error(&query_id, &datasource, &current_sql, &final_error)
                    .await;
                info!(%query_id, attempts, duration_ms, "analyze exhausted corrections");
                Ok(AnalysisResult {
                    intent: MessageIntent::Error,
                    sql: Some(current_sql),
                    columns: None,
                    rows: None,
                    row_count: None,
                    duration_ms,
                    insight: None,
                    clarification: None,
                    chart: None,
                    attempts,
                    errors,
                    answer: None,
                })
            }
            Err(other) => {
                self.record_query_error(&query_id, &datasource, &current_sql, &other.to_string())
                    .await;
                Err(other)
            }
        }
    }

    async fn resolve_datasource(
        &self,
        request: &AnalysisRequest,
    ) -> Result<Datasource, EngineError> {
        let datasource = match request.datasource_id {
            Some(id) => self
                .store
                .get_datasource(&id.to_string())
                .await?
                .ok_or_else(|| EngineError::NotFound(format!("datasource {id}")))?,
            None => self.store.default_datasource().await?.ok_or_else(|| {
                EngineError::NotFound("no datasource given and no default configured".to_string())
            })?,
        };
        self.store
            .touch_datasource(&datasource.id.to_string())
            .await?;
        Ok(datasource)
    }

    async fn resolve_profile(
        &self,
        request: &AnalysisRequest,
    ) -> Result<AgentProfile, EngineError> {
        let mut profile = match &request.agent_profile_id {
            Some(id) => {
                let profiles: Vec<AgentProfile> = match self.store.get_config(PROFILES_KEY).await? {
                    Some(value) => serde_json::from_value(value)?,
                    None => Vec::new(),
                };
                profiles
                    .into_iter()
                    .find(|p| &p.id == id)
                    .ok_or_else(|| EngineError::NotFound(format!("agent profile '{id}'")))?
            }
            None => AgentProfile::named("sql-analyst"),
        };
        if request.llm_binding_id.is_some() {
            profile.llm_binding_id = request.llm_binding_id.clone();
        }
        Ok(profile)
    }

    async fn record_query(
        &self,
        query_id: &str,
        datasource: &Datasource,
        sql: &str,
        output: &QueryOutput,
        error: Option<String>,
    ) {
        let record = QueryRecord {
            id: Uuid::parse_str(query_id).unwrap_or_else(|_| Uuid::new_v4()),
            datasource_id: Some(datasource.id),
            sql: sql.to_string(),
            executed_at: now_iso(),
            duration_ms: output.duration_ms,
            row_count: output.row_count,
            status: QueryStatus::Success,
            error,
        };
        if let Err(e) = self.store.append_query_record(&record).await {
            warn!(%query_id, error = %e, "failed to append query record");
        }
    }

    async fn record_query_error(
        &self,
        query_id: &str,
        datasource: &Datasource,
        sql: &str,
        message: &str,
    ) {
        let record = QueryRecord {
            id: Uuid::parse_str(query_id).unwrap_or_else(|_| Uuid::new_v4()),
            datasource_id: Some(datasource.id),
            sql: sql.to_string(),
            executed_at: now_iso(),
            duration_ms: 0,
            row_count: 0,
            status: QueryStatus::Error,
            error: Some(message.to_string()),
        };
        if let Err(e) = self.store.append_query_record(&record).await {
            warn!(%query_id, error = %e, "failed to append query record");
        }
    }

    async fn log_correction(
        &self,
        query_id: &str,
        attempt: u32,
        original_sql: &str,
        error_message: &str,
        corrected_sql: Option<&str>,
        succeeded: bool,
    ) {
        let record = CorrectionRecord {
            query_id: query_id.to_string(),
            attempt,
            original_sql: original_sql.to_string(),
            error_message: error_message.to_string(),
            corrected_sql: corrected_sql.map(|s| s.to_string()),
            succeeded,
            ts: now_iso(),
        };
        if let Err(e) = self.store.append_correction(&record).await {
            warn!(%query_id, error = %e, "failed to append correction log");
        }
    }

    async fn record_memory(&self, request: &AnalysisRequest, sql: Option<&str>, summary: &str) {
        let result = self
            .memory
            .record(
                MemoryEventType::AnalysisResult,
                Some(request.scene),
                Some(request.question.clone()),
                Some(summary.to_string()),
                sql.map(|s| s.to_string()),
                serde_json::Value::Null,
            )
            .await;
        if let Err(e) = result {
            warn!(error = %e, "failed to record memory event");
        }
    }
}
