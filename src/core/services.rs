//! Explicit wiring of every subsystem into one `Services` value, built once
//! at startup and passed down. Facade operations return `Result`; callers
//! that need the wire envelope fold with [`ResponseEnvelope::from_result`].

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::core::agents::{AgentProfile, AgentRuntime, SchemaAgent, SqlAgent, VisualizeAgent};
use crate::core::analysis::AnalysisPipeline;
use crate::core::db::pool::PoolManager;
use crate::core::db::{self, QueryOptions, QueryOutput, TestConnectionReport};
use crate::core::error::{EngineError, ResponseEnvelope};
use crate::core::execution::{ExecutionEngine, ExecutionRecord, TaskAction};
use crate::core::llm::{LlmBinding, LlmRouter};
use crate::core::memory::{MemoCache, MemoryEvent, MemoryStore};
use crate::core::monitoring::{
    DefaultMetricSource, MetricSource, MonitorService, Notifier, RecordingNotifier,
};
use crate::core::planning::{LoanType, Plan, PlanningEngine};
use crate::core::store::Store;
use crate::core::types::{
    AnalysisRequest, AnalysisResult, ConnectionInfo, CorrectionRecord, Datasource,
    DatasourceKind, DatasourceStatus, QueryRecord, Scene, SchemaDescriptor, StepLog, now_iso,
};

pub struct Services {
    config: EngineConfig,
    store: Arc<Store>,
    pool: Arc<PoolManager>,
    llm: Arc<LlmRouter>,
    memory: Arc<MemoryStore>,
    schema_agent: Arc<SchemaAgent>,
    pipeline: AnalysisPipeline,
    planning: PlanningEngine,
    execution: ExecutionEngine,
    monitoring: Arc<MonitorService>,
}

impl Services {
    /// Open the store under `config.data_dir` and wire everything with the
    /// default metric source and a recording notifier. Production callers
    /// swap capabilities with [`Services::with_capabilities`].
    pub async fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let store = Arc::new(Store::open(&config.data_dir).await?);
        Self::wire(
            config,
            store,
            Arc::new(DefaultMetricSource),
            Arc::new(RecordingNotifier::new()),
        )
    }

    pub async fn with_capabilities(
        config: EngineConfig,
        metric_source: Arc<dyn MetricSource>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, EngineError> {
        let store = Arc::new(Store::open(&config.data_dir).await?);
        Self::wire(config, store, metric_source, notifier)
    }

    /// Fully in-memory engine for tests.
    pub fn in_memory(config: EngineConfig) -> Result<Self, EngineError> {
        let store = Arc::new(Store::open_in_memory()?);
        Self::wire(
            config,
            store,
            Arc::new(DefaultMetricSource),
            Arc::new(RecordingNotifier::new()),
        )
    }

    /// In-memory engine with explicit capabilities.
    pub fn in_memory_with(
        config: EngineConfig,
        metric_source: Arc<dyn MetricSource>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, EngineError> {
        let store = Arc::new(Store::open_in_memory()?);
        Self::wire(config, store, metric_source, notifier)
    }

    fn wire(
        config: EngineConfig,
        store: Arc<Store>,
        metric_source: Arc<dyn MetricSource>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, EngineError> {
        let pool = Arc::new(PoolManager::new(config.pool.clone()));
        let llm = Arc::new(LlmRouter::new());
        let cache = Arc::new(MemoCache::new());
        let memory = Arc::new(MemoryStore::new(store.clone(), config.memory.clone()));
        let runtime = Arc::new(AgentRuntime::new(llm.clone(), store.clone()));

        let schema_agent = Arc::new(SchemaAgent::new(
            pool.clone(),
            cache.clone(),
            Duration::from_millis(config.memory.schema_cache_ttl_ms),
        ));
        let sql_agent = Arc::new(SqlAgent::new(runtime.clone()));
        let visualize_agent = Arc::new(VisualizeAgent::new(runtime.clone()));

        let pipeline = AnalysisPipeline::new(
            config.analyze.clone(),
            pool.clone(),
            store.clone(),
            memory.clone(),
            schema_agent.clone(),
            sql_agent,
            visualize_agent,
        );
        let planning = PlanningEngine::new(store.clone());
        let execution = ExecutionEngine::new(config.execution.clone(), runtime, store.clone());
        let monitoring = Arc::new(MonitorService::new(
            config.monitoring.clone(),
            store.clone(),
            metric_source,
            notifier,
        ));

        Ok(Self {
            config,
            store,
            pool,
            llm,
            memory,
            schema_agent,
            pipeline,
            planning,
            execution,
            monitoring,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register language providers against this router before serving.
    pub fn llm(&self) -> &Arc<LlmRouter> {
        &self.llm
    }

    pub fn monitoring(&self) -> &Arc<MonitorService> {
        &self.monitoring
    }

    pub fn planning(&self) -> &PlanningEngine {
        &self.planning
    }

    pub fn execution(&self) -> &ExecutionEngine {
        &self.execution
    }

    pub fn memory(&self) -> &Arc<MemoryStore> {
        &self.memory
    }

    /// Kick off the periodic monitoring pass; stops with the token.
    pub fn start_monitoring(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        self.monitoring.spawn_loop(cancel)
    }

    // ── Analysis ──

    pub async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisResult, EngineError> {
        self.pipeline
            .analyze(request, CancellationToken::new())
            .await
    }

    pub async fn analyze_with_cancel(
        &self,
        request: &AnalysisRequest,
        cancel: CancellationToken,
    ) -> Result<AnalysisResult, EngineError> {
        self.pipeline.analyze(request, cancel).await
    }

    /// Envelope adapter for transport layers.
    pub fn envelope<T>(result: Result<T, EngineError>) -> ResponseEnvelope<T> {
        ResponseEnvelope::from_result(result)
    }

    // ── Datasources ──

    pub async fn create_datasource(
        &self,
        name: &str,
        kind: DatasourceKind,
        connection: ConnectionInfo,
        is_default: bool,
    ) -> Result<Datasource, EngineError> {
        if name.trim().is_empty() {
            return Err(EngineError::Validation(
                "datasource name must not be empty".to_string(),
            ));
        }
        let now = now_iso();
        let datasource = Datasource {
            id: Uuid::new_v4(),
            name: name.trim().to_string(),
            kind,
            connection,
            status: DatasourceStatus::Active,
            is_default,
            last_used_at: None,
            created_at: now.clone(),
            updated_at: now,
        };
        self.store.upsert_datasource(&datasource).await?;
        Ok(datasource)
    }

    pub async fn update_datasource(&self, mut datasource: Datasource) -> Result<Datasource, EngineError> {
        if self
            .store
            .get_datasource(&datasource.id.to_string())
            .await?
            .is_none()
        {
            return Err(EngineError::NotFound(format!(
                "datasource {}",
                datasource.id
            )));
        }
        datasource.updated_at = now_iso();
        self.store.upsert_datasource(&datasource).await?;
        self.schema_agent.invalidate(&datasource.id);
        Ok(datasource)
    }

    pub async fn list_datasources(&self) -> Result<Vec<Datasource>, EngineError> {
        self.store.list_datasources().await
    }

    pub async fn get_datasource(&self, id: Uuid) -> Result<Datasource, EngineError> {
        self.store
            .get_datasource(&id.to_string())
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("datasource {id}")))
    }

    pub async fn delete_datasource(&self, id: Uuid) -> Result<(), EngineError> {
        if !self.store.delete_datasource(&id.to_string()).await? {
            return Err(EngineError::NotFound(format!("datasource {id}")));
        }
        self.schema_agent.invalidate(&id);
        Ok(())
    }

    pub async fn test_connection(
        &self,
        kind: DatasourceKind,
        connection: &ConnectionInfo,
    ) -> TestConnectionReport {
        db::test_connection(kind, connection).await
    }

    /// Full schema of a datasource, unfiltered.
    pub async fn get_schema(&self, datasource_id: Uuid) -> Result<SchemaDescriptor, EngineError> {
        let datasource = self.get_datasource(datasource_id).await?;
        self.schema_agent.relevant_schema(&datasource, None).await
    }

    /// Direct query execution for operators; bypasses the agents but not the
    /// pool or the row ceiling.
    pub async fn execute_query(
        &self,
        datasource_id: Uuid,
        sql: &str,
        timeout_ms: u64,
        max_rows: usize,
    ) -> Result<QueryOutput, EngineError> {
        let datasource = self.get_datasource(datasource_id).await?;
        let mut conn = self.pool.acquire(&datasource).await?;
        let output = conn
            .execute(
                sql,
                &QueryOptions {
                    timeout_ms,
                    max_rows,
                },
            )
            .await?;
        self.store
            .touch_datasource(&datasource_id.to_string())
            .await?;
        Ok(output)
    }

    // ── Planning & execution ──

    pub async fn build_plan(
        &self,
        question: &str,
        scene: Scene,
        loan_type: Option<LoanType>,
    ) -> Result<Plan, EngineError> {
        self.planning.build_plan(question, scene, loan_type).await
    }

    /// Start from an existing plan, or build one from the question.
    pub async fn start_execution(
        &self,
        plan_id: Option<&str>,
        question: Option<&str>,
        scene: Scene,
        loan_type: Option<LoanType>,
    ) -> Result<ExecutionRecord, EngineError> {
        let plan = match (plan_id, question) {
            (Some(id), _) => self.planning.get_plan(id).await?,
            (None, Some(question)) => self.planning.build_plan(question, scene, loan_type).await?,
            (None, None) => {
                return Err(EngineError::Validation(
                    "either plan_id or question is required".to_string(),
                ));
            }
        };
        self.execution.start(&plan).await
    }

    pub async fn tick_execution(&self, execution_id: &str) -> Result<ExecutionRecord, EngineError> {
        self.execution.tick(execution_id).await
    }

    pub async fn run_execution(
        &self,
        execution_id: &str,
        max_steps: u32,
    ) -> Result<ExecutionRecord, EngineError> {
        self.execution.run(execution_id, max_steps).await
    }

    pub async fn execution_task_action(
        &self,
        execution_id: &str,
        task_id: &str,
        action: TaskAction,
        note: Option<&str>,
    ) -> Result<ExecutionRecord, EngineError> {
        self.execution
            .task_action(execution_id, task_id, action, note)
            .await
    }

    pub async fn cancel_execution(
        &self,
        execution_id: &str,
    ) -> Result<ExecutionRecord, EngineError> {
        self.execution.cancel(execution_id).await
    }

    // ── Config family ──

    pub async fn llm_bindings(&self) -> Result<Vec<LlmBinding>, EngineError> {
        match self.store.get_config("llm_bindings").await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(Vec::new()),
        }
    }

    pub async fn update_llm_bindings(
        &self,
        bindings: Vec<LlmBinding>,
    ) -> Result<Vec<LlmBinding>, EngineError> {
        if bindings.iter().filter(|b| b.is_default).count() > 1 {
            return Err(EngineError::Validation(
                "at most one LLM binding may be the default".to_string(),
            ));
        }
        self.store
            .put_config("llm_bindings", &serde_json::to_value(&bindings)?)
            .await?;
        Ok(bindings)
    }

    pub async fn agent_profiles(&self) -> Result<Vec<AgentProfile>, EngineError> {
        match self.store.get_config("agent_profiles").await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(Vec::new()),
        }
    }

    pub async fn update_agent_profiles(
        &self,
        profiles: Vec<AgentProfile>,
    ) -> Result<Vec<AgentProfile>, EngineError> {
        for profile in &profiles {
            if profile.id.is_empty() {
                return Err(EngineError::Validation(
                    "agent profile id must not be empty".to_string(),
                ));
            }
        }
        self.store
            .put_config("agent_profiles", &serde_json::to_value(&profiles)?)
            .await?;
        Ok(profiles)
    }

    // ── History ──

    pub async fn query_history(&self, limit: usize) -> Result<Vec<QueryRecord>, EngineError> {
        self.store.list_query_history(limit).await
    }

    pub async fn execution_logs(
        &self,
        execution_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<StepLog>, EngineError> {
        self.store.list_step_logs(execution_id, limit).await
    }

    pub async fn correction_logs(
        &self,
        query_id: &str,
    ) -> Result<Vec<CorrectionRecord>, EngineError> {
        self.store.list_corrections(query_id).await
    }

    pub async fn recent_corrections(
        &self,
        limit: usize,
    ) -> Result<Vec<CorrectionRecord>, EngineError> {
        self.store.list_recent_corrections(limit).await
    }

    pub async fn search_memory(
        &self,
        query: &str,
        limit: usize,
        scene: Option<Scene>,
    ) -> Result<Vec<MemoryEvent>, EngineError> {
        self.memory.search(query, limit, scene).await
    }
}
