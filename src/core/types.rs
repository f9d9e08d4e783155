//! Shared entities manipulated across subsystems: datasources, schema
//! descriptors, agent messages, analysis requests/results and the append-only
//! history records.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Datasources ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasourceKind {
    Postgres,
    Mysql,
    Mssql,
    Clickhouse,
    Duckdb,
    Sqlite,
    Snowflake,
    Bigquery,
    Trino,
}

impl DatasourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DatasourceKind::Postgres => "postgres",
            DatasourceKind::Mysql => "mysql",
            DatasourceKind::Mssql => "mssql",
            DatasourceKind::Clickhouse => "clickhouse",
            DatasourceKind::Duckdb => "duckdb",
            DatasourceKind::Sqlite => "sqlite",
            DatasourceKind::Snowflake => "snowflake",
            DatasourceKind::Bigquery => "bigquery",
            DatasourceKind::Trino => "trino",
        }
    }

    pub fn from_str_tag(value: &str) -> Option<Self> {
        match value {
            "postgres" => Some(DatasourceKind::Postgres),
            "mysql" => Some(DatasourceKind::Mysql),
            "mssql" => Some(DatasourceKind::Mssql),
            "clickhouse" => Some(DatasourceKind::Clickhouse),
            "duckdb" => Some(DatasourceKind::Duckdb),
            "sqlite" => Some(DatasourceKind::Sqlite),
            "snowflake" => Some(DatasourceKind::Snowflake),
            "bigquery" => Some(DatasourceKind::Bigquery),
            "trino" => Some(DatasourceKind::Trino),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasourceStatus {
    Active,
    Inactive,
    Error,
}

/// Connection parameters. Treated as an opaque bag by everything except the
/// adapter for the matching kind; unknown keys ride along in `options`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// File path for embedded engines (sqlite, duckdb).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Datasource {
    pub id: Uuid,
    pub name: String,
    pub kind: DatasourceKind,
    pub connection: ConnectionInfo,
    pub status: DatasourceStatus,
    pub is_default: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

// ── Schema descriptors ──

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    pub tables: Vec<TableDescriptor>,
    pub dialect: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub name: String,
    pub columns: Vec<ColumnDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub primary_key: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreign_key: Option<ForeignKeyRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeignKeyRef {
    pub table: String,
    pub column: String,
}

// ── Agent messages ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageIntent {
    Answer,
    Clarification,
    Error,
}

/// Immutable message emitted by an agent. `data` carries the structured
/// payload when the provider replied with JSON; anything the engine does not
/// model explicitly stays in `metadata`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    pub intent: MessageIntent,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

// ── Scenes ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Scene {
    Dashboard,
    #[default]
    DataDiscuss,
    LoanOps,
}

impl Scene {
    pub fn as_str(self) -> &'static str {
        match self {
            Scene::Dashboard => "dashboard",
            Scene::DataDiscuss => "data_discuss",
            Scene::LoanOps => "loan_ops",
        }
    }

    /// Per-scene execution defaults: query timeout, row ceiling, write policy.
    pub fn defaults(self) -> SceneDefaults {
        match self {
            Scene::Dashboard => SceneDefaults {
                timeout_ms: 30_000,
                max_rows: 1_000,
                read_only: true,
            },
            Scene::DataDiscuss => SceneDefaults {
                timeout_ms: 30_000,
                max_rows: 1_000,
                read_only: false,
            },
            Scene::LoanOps => SceneDefaults {
                timeout_ms: 60_000,
                max_rows: 5_000,
                read_only: true,
            },
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SceneDefaults {
    pub timeout_ms: u64,
    pub max_rows: usize,
    pub read_only: bool,
}

// ── Analysis contract ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datasource_id: Option<Uuid>,
    #[serde(default)]
    pub scene: Scene,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_binding_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_profile_id: Option<String>,
    #[serde(default)]
    pub visualize: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Clarification {
    pub question: String,
    /// At most four concrete refinements the user can pick from.
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Insight {
    pub summary: String,
    #[serde(default)]
    pub key_points: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChartSpec {
    pub chart_type: String,
    pub spec: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub intent: MessageIntent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<crate::core::db::QueryColumn>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<Vec<serde_json::Value>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<usize>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insight: Option<Insight>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clarification: Option<Clarification>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart: Option<ChartSpec>,
    /// Total SQL execution attempts, corrections included.
    pub attempts: u32,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
}

// ── Append-only records ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRecord {
    pub id: Uuid,
    pub datasource_id: Option<Uuid>,
    pub sql: String,
    pub executed_at: String,
    pub duration_ms: u64,
    pub row_count: usize,
    pub status: QueryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrectionRecord {
    pub query_id: String,
    pub attempt: u32,
    pub original_sql: String,
    pub error_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corrected_sql: Option<String>,
    pub succeeded: bool,
    pub ts: String,
}

/// One structured log line for an agent or execution step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepLog {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_id: Option<String>,
    pub step: String,
    pub status: String,
    pub detail: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub ts: String,
}

/// Current UTC timestamp in the ISO-8601 form every persisted record uses.
pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
