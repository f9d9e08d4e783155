//! Engine-local persistence: a single sqlite file holding the config family
//! (datasources, planning/monitoring/email configs) and the event family
//! (query history, correction logs, executions, alerts, memory events).
//!
//! Complex records are stored as JSON columns next to the keys the engine
//! filters on; the subsystems own their (de)serialization.

use std::path::Path;
use std::sync::Arc;

use rusqlite::{Connection, params};
use tokio::sync::Mutex;
use tracing::info;

use crate::core::error::EngineError;
use crate::core::types::{
    CorrectionRecord, Datasource, DatasourceKind, DatasourceStatus, QueryRecord, QueryStatus,
    StepLog, now_iso,
};

pub struct Store {
    db: Arc<Mutex<Connection>>,
}

impl Store {
    pub async fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self, EngineError> {
        let data_dir = data_dir.as_ref().to_path_buf();
        if !data_dir.exists() {
            tokio::fs::create_dir_all(&data_dir)
                .await
                .map_err(|e| EngineError::internal(format!("create data dir: {e}")))?;
        }
        let db_path = data_dir.join("engine.db");
        let db = Connection::open(&db_path)?;
        Self::bootstrap(&db)?;
        info!(path = %db_path.display(), "engine store opened");
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    /// In-memory store for tests and ephemeral runs.
    pub fn open_in_memory() -> Result<Self, EngineError> {
        let db = Connection::open_in_memory()?;
        Self::bootstrap(&db)?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    fn bootstrap(db: &Connection) -> Result<(), EngineError> {
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS datasources (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                kind TEXT NOT NULL,
                connection_json TEXT NOT NULL,
                status TEXT NOT NULL,
                is_default INTEGER NOT NULL DEFAULT 0,
                last_used_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS query_history (
                id TEXT PRIMARY KEY,
                datasource_id TEXT,
                sql TEXT NOT NULL,
                executed_at TEXT NOT NULL,
                duration_ms INTEGER NOT NULL,
                row_count INTEGER NOT NULL,
                status TEXT NOT NULL,
                error TEXT
            );
            CREATE TABLE IF NOT EXISTS correction_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                query_id TEXT NOT NULL,
                attempt INTEGER NOT NULL,
                original_sql TEXT NOT NULL,
                error_message TEXT NOT NULL,
                corrected_sql TEXT,
                succeeded INTEGER NOT NULL,
                ts TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS step_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                execution_id TEXT,
                profile_id TEXT,
                step TEXT NOT NULL,
                status TEXT NOT NULL,
                detail TEXT NOT NULL,
                metadata_json TEXT NOT NULL,
                ts TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS executions (
                execution_id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                snapshot_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS plan_history (
                plan_id TEXT PRIMARY KEY,
                snapshot_json TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS alerts (
                id TEXT PRIMARY KEY,
                rule_id TEXT NOT NULL,
                metric_key TEXT NOT NULL,
                status TEXT NOT NULL,
                triggered_at TEXT NOT NULL,
                snapshot_json TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS memory_events (
                id TEXT PRIMARY KEY,
                ts TEXT NOT NULL,
                event_type TEXT NOT NULL,
                scene TEXT,
                user_text TEXT,
                result_summary TEXT,
                sql TEXT,
                metadata_json TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS config_kv (
                key TEXT PRIMARY KEY,
                value_json TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    // ── Datasources ──

    pub async fn upsert_datasource(&self, ds: &Datasource) -> Result<(), EngineError> {
        let db = self.db.lock().await;
        if ds.is_default {
            db.execute(
                "UPDATE datasources SET is_default = 0 WHERE id != ?1",
                params![ds.id.to_string()],
            )?;
        }
        let result = db.execute(
            "INSERT INTO datasources
                (id, name, kind, connection_json, status, is_default, last_used_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                kind = excluded.kind,
                connection_json = excluded.connection_json,
                status = excluded.status,
                is_default = excluded.is_default,
                last_used_at = excluded.last_used_at,
                updated_at = excluded.updated_at",
            params![
                ds.id.to_string(),
                ds.name,
                ds.kind.as_str(),
                serde_json::to_string(&ds.connection)?,
                status_tag(ds.status),
                ds.is_default as i32,
                ds.last_used_at,
                ds.created_at,
                ds.updated_at,
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(EngineError::Conflict(format!(
                    "datasource name '{}' already exists",
                    ds.name
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn list_datasources(&self) -> Result<Vec<Datasource>, EngineError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, name, kind, connection_json, status, is_default, last_used_at, created_at, updated_at
             FROM datasources ORDER BY created_at",
        )?;
        let rows = stmt.query_map([], row_to_datasource)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row??);
        }
        Ok(results)
    }

    pub async fn get_datasource(&self, id: &str) -> Result<Option<Datasource>, EngineError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, name, kind, connection_json, status, is_default, last_used_at, created_at, updated_at
             FROM datasources WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id], row_to_datasource)?;
        match rows.next() {
            Some(row) => Ok(Some(row??)),
            None => Ok(None),
        }
    }

    pub async fn default_datasource(&self) -> Result<Option<Datasource>, EngineError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, name, kind, connection_json, status, is_default, last_used_at, created_at, updated_at
             FROM datasources WHERE is_default = 1 AND status = 'active' LIMIT 1",
        )?;
        let mut rows = stmt.query_map([], row_to_datasource)?;
        match rows.next() {
            Some(row) => Ok(Some(row??)),
            None => Ok(None),
        }
    }

    pub async fn delete_datasource(&self, id: &str) -> Result<bool, EngineError> {
        let db = self.db.lock().await;
        let deleted = db.execute("DELETE FROM datasources WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    pub async fn touch_datasource(&self, id: &str) -> Result<(), EngineError> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE datasources SET last_used_at = ?1 WHERE id = ?2",
            params![now_iso(), id],
        )?;
        Ok(())
    }

    // ── Query history + correction logs ──

    pub async fn append_query_record(&self, record: &QueryRecord) -> Result<(), EngineError> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO query_history
                (id, datasource_id, sql, executed_at, duration_ms, row_count, status, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.id.to_string(),
                record.datasource_id.map(|id| id.to_string()),
                record.sql,
                record.executed_at,
                record.duration_ms as i64,
                record.row_count as i64,
                match record.status {
                    QueryStatus::Success => "success",
                    QueryStatus::Error => "error",
                },
                record.error,
            ],
        )?;
        Ok(())
    }

    pub async fn list_query_history(&self, limit: usize) -> Result<Vec<QueryRecord>, EngineError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, datasource_id, sql, executed_at, duration_ms, row_count, status, error
             FROM query_history ORDER BY executed_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, Option<String>>(7)?,
            ))
        })?;
        let mut results = Vec::new();
        for row in rows {
            let (id, datasource_id, sql, executed_at, duration_ms, row_count, status, error) = row?;
            results.push(QueryRecord {
                id: parse_uuid(&id)?,
                datasource_id: match datasource_id {
                    Some(s) => Some(parse_uuid(&s)?),
                    None => None,
                },
                sql,
                executed_at,
                duration_ms: duration_ms as u64,
                row_count: row_count as usize,
                status: if status == "success" {
                    QueryStatus::Success
                } else {
                    QueryStatus::Error
                },
                error,
            });
        }
        Ok(results)
    }

    pub async fn append_correction(&self, record: &CorrectionRecord) -> Result<(), EngineError> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO correction_logs
                (query_id, attempt, original_sql, error_message, corrected_sql, succeeded, ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.query_id,
                record.attempt as i64,
                record.original_sql,
                record.error_message,
                record.corrected_sql,
                record.succeeded as i32,
                record.ts,
            ],
        )?;
        Ok(())
    }

    pub async fn list_corrections(
        &self,
        query_id: &str,
    ) -> Result<Vec<CorrectionRecord>, EngineError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT query_id, attempt, original_sql, error_message, corrected_sql, succeeded, ts
             FROM correction_logs WHERE query_id = ?1 ORDER BY attempt",
        )?;
        let rows = stmt.query_map(params![query_id], |row| {
            Ok(CorrectionRecord {
                query_id: row.get(0)?,
                attempt: row.get::<_, i64>(1)? as u32,
                original_sql: row.get(2)?,
                error_message: row.get(3)?,
                corrected_sql: row.get(4)?,
                succeeded: row.get::<_, i32>(5)? != 0,
                ts: row.get(6)?,
            })
        })?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub async fn list_recent_corrections(
        &self,
        limit: usize,
    ) -> Result<Vec<CorrectionRecord>, EngineError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT query_id, attempt, original_sql, error_message, corrected_sql, succeeded, ts
             FROM correction_logs ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(CorrectionRecord {
                query_id: row.get(0)?,
                attempt: row.get::<_, i64>(1)? as u32,
                original_sql: row.get(2)?,
                error_message: row.get(3)?,
                corrected_sql: row.get(4)?,
                succeeded: row.get::<_, i32>(5)? != 0,
                ts: row.get(6)?,
            })
        })?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    // ── Step logs ──

    pub async fn append_step_log(&self, log: &StepLog) -> Result<(), EngineError> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO step_logs (execution_id, profile_id, step, status, detail, metadata_json, ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                log.execution_id,
                log.profile_id,
                log.step,
                log.status,
                log.detail,
                serde_json::to_string(&log.metadata)?,
                log.ts,
            ],
        )?;
        // Keep the log bounded.
        db.execute(
            "DELETE FROM step_logs WHERE id NOT IN
                (SELECT id FROM step_logs ORDER BY id DESC LIMIT 2000)",
            [],
        )?;
        Ok(())
    }

    pub async fn list_step_logs(
        &self,
        execution_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<StepLog>, EngineError> {
        let db = self.db.lock().await;
        let mut results = Vec::new();
        let map_row = |row: &rusqlite::Row<'_>| {
            Ok((
                row.get::<_, Option<String>>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        };
        let rows: Vec<_> = if let Some(id) = execution_id {
            let mut stmt = db.prepare(
                "SELECT execution_id, profile_id, step, status, detail, metadata_json, ts
                 FROM step_logs WHERE execution_id = ?1 ORDER BY id DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![id, limit as i64], map_row)?;
            rows.collect::<Result<_, _>>()?
        } else {
            let mut stmt = db.prepare(
                "SELECT execution_id, profile_id, step, status, detail, metadata_json, ts
                 FROM step_logs ORDER BY id DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], map_row)?;
            rows.collect::<Result<_, _>>()?
        };
        for (execution_id, profile_id, step, status, detail, metadata_json, ts) in rows {
            results.push(StepLog {
                execution_id,
                profile_id,
                step,
                status,
                detail,
                metadata: serde_json::from_str(&metadata_json)
                    .unwrap_or(serde_json::Value::Null),
                ts,
            });
        }
        Ok(results)
    }

    // ── Executions ──

    pub async fn save_execution(
        &self,
        execution_id: &str,
        state: &str,
        snapshot_json: &str,
    ) -> Result<(), EngineError> {
        let db = self.db.lock().await;
        let now = now_iso();
        db.execute(
            "INSERT INTO executions (execution_id, state, snapshot_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(execution_id) DO UPDATE SET
                state = excluded.state,
                snapshot_json = excluded.snapshot_json,
                updated_at = excluded.updated_at",
            params![execution_id, state, snapshot_json, now],
        )?;
        Ok(())
    }

    pub async fn get_execution_snapshot(
        &self,
        execution_id: &str,
    ) -> Result<Option<String>, EngineError> {
        let db = self.db.lock().await;
        let mut stmt =
            db.prepare("SELECT snapshot_json FROM executions WHERE execution_id = ?1")?;
        let mut rows = stmt.query_map(params![execution_id], |row| row.get::<_, String>(0))?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub async fn list_execution_snapshots(
        &self,
        limit: usize,
    ) -> Result<Vec<String>, EngineError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT snapshot_json FROM executions ORDER BY updated_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| row.get::<_, String>(0))?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    // ── Plans ──

    pub async fn append_plan(
        &self,
        plan_id: &str,
        snapshot_json: &str,
    ) -> Result<(), EngineError> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT OR REPLACE INTO plan_history (plan_id, snapshot_json, created_at)
             VALUES (?1, ?2, ?3)",
            params![plan_id, snapshot_json, now_iso()],
        )?;
        // Keep the history bounded.
        db.execute(
            "DELETE FROM plan_history WHERE plan_id NOT IN
                (SELECT plan_id FROM plan_history ORDER BY created_at DESC LIMIT 300)",
            [],
        )?;
        Ok(())
    }

    pub async fn get_plan(&self, plan_id: &str) -> Result<Option<String>, EngineError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare("SELECT snapshot_json FROM plan_history WHERE plan_id = ?1")?;
        let mut rows = stmt.query_map(params![plan_id], |row| row.get::<_, String>(0))?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub async fn list_plans(&self, limit: usize) -> Result<Vec<String>, EngineError> {
        let db = self.db.lock().await;
        let mut stmt =
            db.prepare("SELECT snapshot_json FROM plan_history ORDER BY created_at DESC LIMIT ?1")?;
        let rows = stmt.query_map(params![limit as i64], |row| row.get::<_, String>(0))?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    // ── Alerts ──

    pub async fn append_alert(
        &self,
        id: &str,
        rule_id: &str,
        metric_key: &str,
        status: &str,
        triggered_at: &str,
        snapshot_json: &str,
    ) -> Result<(), EngineError> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO alerts (id, rule_id, metric_key, status, triggered_at, snapshot_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, rule_id, metric_key, status, triggered_at, snapshot_json],
        )?;
        Ok(())
    }

    pub async fn update_alert(
        &self,
        id: &str,
        status: &str,
        snapshot_json: &str,
    ) -> Result<bool, EngineError> {
        let db = self.db.lock().await;
        let updated = db.execute(
            "UPDATE alerts SET status = ?1, snapshot_json = ?2 WHERE id = ?3",
            params![status, snapshot_json, id],
        )?;
        Ok(updated > 0)
    }

    pub async fn get_alert(&self, id: &str) -> Result<Option<String>, EngineError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare("SELECT snapshot_json FROM alerts WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![id], |row| row.get::<_, String>(0))?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub async fn list_alerts(
        &self,
        limit: usize,
        status: Option<&str>,
    ) -> Result<Vec<String>, EngineError> {
        let db = self.db.lock().await;
        let mut results = Vec::new();
        if let Some(status) = status {
            let mut stmt = db.prepare(
                "SELECT snapshot_json FROM alerts WHERE status = ?1
                 ORDER BY triggered_at DESC LIMIT ?2",
            )?;
            let rows =
                stmt.query_map(params![status, limit as i64], |row| row.get::<_, String>(0))?;
            for row in rows {
                results.push(row?);
            }
        } else {
            let mut stmt = db
                .prepare("SELECT snapshot_json FROM alerts ORDER BY triggered_at DESC LIMIT ?1")?;
            let rows = stmt.query_map(params![limit as i64], |row| row.get::<_, String>(0))?;
            for row in rows {
                results.push(row?);
            }
        }
        Ok(results)
    }

    /// Most recent alert for a suppression key that has not been acknowledged.
    pub async fn latest_open_alert(
        &self,
        rule_id: &str,
        metric_key: &str,
    ) -> Result<Option<(String, String)>, EngineError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT triggered_at, snapshot_json FROM alerts
             WHERE rule_id = ?1 AND metric_key = ?2 AND status != 'acknowledged'
             ORDER BY triggered_at DESC LIMIT 1",
        )?;
        let mut rows = stmt.query_map(params![rule_id, metric_key], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    // ── Memory events (raw rows; scoring lives in core::memory) ──

    pub async fn append_memory_event_row(
        &self,
        id: &str,
        ts: &str,
        event_type: &str,
        scene: Option<&str>,
        user_text: Option<&str>,
        result_summary: Option<&str>,
        sql: Option<&str>,
        metadata_json: &str,
        max_events: usize,
        retention_days: i64,
    ) -> Result<(), EngineError> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO memory_events
                (id, ts, event_type, scene, user_text, result_summary, sql, metadata_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![id, ts, event_type, scene, user_text, result_summary, sql, metadata_json],
        )?;
        let cutoff = (chrono::Utc::now() - chrono::Duration::days(retention_days))
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        db.execute("DELETE FROM memory_events WHERE ts < ?1", params![cutoff])?;
        db.execute(
            "DELETE FROM memory_events WHERE id NOT IN
                (SELECT id FROM memory_events ORDER BY ts DESC LIMIT ?1)",
            params![max_events as i64],
        )?;
        Ok(())
    }

    #[allow(clippy::type_complexity)]
    pub async fn list_memory_event_rows(
        &self,
        limit: usize,
        scene: Option<&str>,
        event_type: Option<&str>,
    ) -> Result<
        Vec<(
            String,
            String,
            String,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
            String,
        )>,
        EngineError,
    > {
        let db = self.db.lock().await;
        let mut sql = String::from(
            "SELECT id, ts, event_type, scene, user_text, result_summary, sql, metadata_json
             FROM memory_events WHERE 1=1",
        );
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        if let Some(scene) = scene {
            sql.push_str(" AND scene = ?");
            args.push(Box::new(scene.to_string()));
        }
        if let Some(event_type) = event_type {
            sql.push_str(" AND event_type = ?");
            args.push(Box::new(event_type.to_string()));
        }
        sql.push_str(" ORDER BY ts DESC LIMIT ?");
        args.push(Box::new(limit as i64));

        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, String>(7)?,
            ))
        })?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    // ── Config family (last-writer-wins, monotonic updated_at) ──

    pub async fn put_config(
        &self,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<(), EngineError> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO config_kv (key, value_json, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
                value_json = excluded.value_json,
                updated_at = excluded.updated_at",
            params![key, serde_json::to_string(value)?, now_iso()],
        )?;
        Ok(())
    }

    pub async fn get_config(&self, key: &str) -> Result<Option<serde_json::Value>, EngineError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare("SELECT value_json FROM config_kv WHERE key = ?1")?;
        let mut rows = stmt.query_map(params![key], |row| row.get::<_, String>(0))?;
        match rows.next() {
            Some(row) => Ok(Some(serde_json::from_str(&row?)?)),
            None => Ok(None),
        }
    }
}

fn status_tag(status: DatasourceStatus) -> &'static str {
    match status {
        DatasourceStatus::Active => "active",
        DatasourceStatus::Inactive => "inactive",
        DatasourceStatus::Error => "error",
    }
}

fn parse_uuid(value: &str) -> Result<uuid::Uuid, EngineError> {
    uuid::Uuid::parse_str(value)
        .map_err(|e| EngineError::internal(format!("corrupt uuid in store: {e}")))
}

type DatasourceRow = Result<Datasource, EngineError>;

fn row_to_datasource(row: &rusqlite::Row<'_>) -> rusqlite::Result<DatasourceRow> {
    let id: String = row.get(0)?;
    let name: String = row.get(1)?;
    let kind: String = row.get(2)?;
    let connection_json: String = row.get(3)?;
    let status: String = row.get(4)?;
    let is_default: i32 = row.get(5)?;
    let last_used_at: Option<String> = row.get(6)?;
    let created_at: String = row.get(7)?;
    let updated_at: String = row.get(8)?;

    Ok((|| {
        Ok(Datasource {
            id: parse_uuid(&id)?,
            name,
            kind: DatasourceKind::from_str_tag(&kind)
                .ok_or_else(|| EngineError::internal(format!("unknown datasource kind '{kind}'")))?,
            connection: serde_json::from_str(&connection_json)?,
            status: match status.as_str() {
                "active" => DatasourceStatus::Active,
                "inactive" => DatasourceStatus::Inactive,
                _ => DatasourceStatus::Error,
            },
            is_default: is_default != 0,
            last_used_at,
            created_at,
            updated_at,
        })
    })())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ConnectionInfo;
    use uuid::Uuid;

    fn sample_datasource(name: &str, is_default: bool) -> Datasource {
        Datasource {
            id: Uuid::new_v4(),
            name: name.to_string(),
            kind: DatasourceKind::Sqlite,
            connection: ConnectionInfo {
                path: Some(":memory:".to_string()),
                ..Default::default()
            },
            status: DatasourceStatus::Active,
            is_default,
            last_used_at: None,
            created_at: now_iso(),
            updated_at: now_iso(),
        }
    }

    #[tokio::test]
    async fn datasource_crud_and_single_default() {
        let store = Store::open_in_memory().unwrap();
        let a = sample_datasource("sales", true);
        let b = sample_datasource("risk", true);
        store.upsert_datasource(&a).await.unwrap();
        store.upsert_datasource(&b).await.unwrap();

        let all = store.list_datasources().await.unwrap();
        assert_eq!(all.len(), 2);
        let defaults: Vec<_> = all.iter().filter(|d| d.is_default).collect();
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults[0].name, "risk");

        let fetched = store
            .get_datasource(&a.id.to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.name, "sales");
        assert!(store.delete_datasource(&a.id.to_string()).await.unwrap());
        assert!(store.get_datasource(&a.id.to_string()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_name_is_conflict() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_datasource(&sample_datasource("sales", false))
            .await
            .unwrap();
        let err = store
            .upsert_datasource(&sample_datasource("sales", false))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::core::error::ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn config_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let value = serde_json::json!({"rules": [{"id": "r1"}]});
        store.put_config("monitoring_rules", &value).await.unwrap();
        let loaded = store.get_config("monitoring_rules").await.unwrap().unwrap();
        assert_eq!(loaded, value);
        assert!(store.get_config("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn correction_logs_ordered_by_attempt() {
        let store = Store::open_in_memory().unwrap();
        for attempt in [2u32, 1u32] {
            store
                .append_correction(&CorrectionRecord {
                    query_id: "q1".to_string(),
                    attempt,
                    original_sql: "SELECT x".to_string(),
                    error_message: "no such column: x".to_string(),
                    corrected_sql: Some("SELECT y".to_string()),
                    succeeded: attempt == 2,
                    ts: now_iso(),
                })
                .await
                .unwrap();
        }
        let logs = store.list_corrections("q1").await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].attempt, 1);
        assert!(logs[1].succeeded);
    }
}
