//! Process-wide connection pool, keyed by datasource id.
//!
//! Two ceilings apply: a per-datasource cap and a global cap, both enforced
//! with semaphores so acquisition is FIFO. Idle connections older than the
//! health interval get probed before hand-out; dead ones are replaced with a
//! bounded, jittered backoff.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::PoolConfig;
use crate::core::error::EngineError;
use crate::core::types::{Datasource, SchemaDescriptor};

use super::{Adapter, Dialect, QueryOptions, QueryOutput, connect_adapter};

const BACKOFF_BASE_MS: u64 = 100;

pub struct PoolManager {
    cfg: PoolConfig,
    global_slots: Arc<Semaphore>,
    pools: Mutex<HashMap<Uuid, Arc<DatasourcePool>>>,
}

struct DatasourcePool {
    datasource: Datasource,
    slots: Arc<Semaphore>,
    idle: StdMutex<Vec<IdleConn>>,
}

struct IdleConn {
    adapter: Box<dyn Adapter>,
    last_checked_at: Instant,
}

/// A checked-out connection. Dropping it returns the underlying adapter to
/// the pool unless a transient failure marked it broken.
pub struct PooledConnection {
    adapter: Option<Box<dyn Adapter>>,
    dialect: Dialect,
    last_checked_at: Instant,
    broken: bool,
    pool: Arc<DatasourcePool>,
    _slot: OwnedSemaphorePermit,
    _global_slot: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("dialect", &self.dialect)
            .field("last_checked_at", &self.last_checked_at)
            .field("broken", &self.broken)
            .finish()
    }
}

impl PoolManager {
    pub fn new(cfg: PoolConfig) -> Self {
        Self {
            global_slots: Arc::new(Semaphore::new(cfg.max_total)),
            pools: Mutex::new(HashMap::new()),
            cfg,
        }
    }

    /// Check out a connection for the datasource, waiting at most the
    /// configured acquire timeout before failing with `POOL_EXHAUSTED`.
    pub async fn acquire(&self, datasource: &Datasource) -> Result<PooledConnection, EngineError> {
        let pool = self.pool_for(datasource).await;
        let deadline = Duration::from_millis(self.cfg.acquire_timeout_ms);

        let slots = pool.slots.clone();
        let global = self.global_slots.clone();
        let (slot, global_slot) = tokio::time::timeout(deadline, async move {
            let slot = slots
                .acquire_owned()
                .await
                .map_err(|_| EngineError::internal("datasource pool closed"))?;
            let global_slot = global
                .acquire_owned()
                .await
                .map_err(|_| EngineError::internal("global pool closed"))?;
            Ok::<_, EngineError>((slot, global_slot))
        })
        .await
        .map_err(|_| {
            EngineError::PoolExhausted(format!(
                "no connection for datasource '{}' within {}ms",
                datasource.name, self.cfg.acquire_timeout_ms
            ))
        })??;

        let health_interval = Duration::from_millis(self.cfg.health_interval_ms);
        loop {
            let candidate = {
                let mut idle = pool.idle.lock().unwrap_or_else(|p| p.into_inner());
                idle.pop()
            };
            let Some(mut conn) = candidate else { break };

            if conn.last_checked_at.elapsed() <= health_interval {
                return Ok(self.wrap(conn.adapter, conn.last_checked_at, pool, slot, global_slot));
            }
            match conn.adapter.probe().await {
                Ok(()) => {
                    debug!(datasource = %datasource.name, "idle connection passed probe");
                    return Ok(self.wrap(conn.adapter, Instant::now(), pool, slot, global_slot));
                }
                Err(e) => {
                    warn!(datasource = %datasource.name, error = %e, "discarding dead pooled connection");
                }
            }
        }

        let adapter = self.connect_with_retry(&pool.datasource).await?;
        Ok(self.wrap(adapter, Instant::now(), pool, slot, global_slot))
    }

    fn wrap(
        &self,
        adapter: Box<dyn Adapter>,
        last_checked_at: Instant,
        pool: Arc<DatasourcePool>,
        slot: OwnedSemaphorePermit,
        global_slot: OwnedSemaphorePermit,
    ) -> PooledConnection {
        PooledConnection {
            dialect: adapter.dialect(),
            adapter: Some(adapter),
            last_checked_at,
            broken: false,
            pool,
            _slot: slot,
            _global_slot: global_slot,
        }
    }

    async fn pool_for(&self, datasource: &Datasource) -> Arc<DatasourcePool> {
        let mut pools = self.pools.lock().await;
        if let Some(existing) = pools.get(&datasource.id)
            && existing.datasource.kind == datasource.kind
            && existing.datasource.connection == datasource.connection
        {
            return existing.clone();
        }
        // New datasource, or its connection config changed: start a fresh
        // sub-pool and let the old idle connections drop.
        let pool = Arc::new(DatasourcePool {
            datasource: datasource.clone(),
            slots: Arc::new(Semaphore::new(self.cfg.max_per_datasource)),
            idle: StdMutex::new(Vec::new()),
        });
        pools.insert(datasource.id, pool.clone());
        pool
    }

    async fn connect_with_retry(
        &self,
        datasource: &Datasource,
    ) -> Result<Box<dyn Adapter>, EngineError> {
        let mut last_err: Option<EngineError> = None;
        for attempt in 0..=self.cfg.connect_retries {
            if attempt > 0 {
                let base = BACKOFF_BASE_MS * 4u64.pow(attempt - 1);
                tokio::time::sleep(jittered(base)).await;
            }
            match connect_adapter(datasource.kind, &datasource.connection).await {
                Ok(adapter) => return Ok(adapter),
                Err(e) if e.retryable() && attempt < self.cfg.connect_retries => {
                    warn!(
                        datasource = %datasource.name,
                        attempt = attempt + 1,
                        error = %e,
                        "connect failed, retrying"
                    );
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err
            .unwrap_or_else(|| EngineError::DbTransient("connect retries exhausted".to_string())))
    }
}

/// Exponential backoff base with +-20% jitter.
fn jittered(base_ms: u64) -> Duration {
    let factor = rand::thread_rng().gen_range(0.8..1.2);
    Duration::from_millis((base_ms as f64 * factor) as u64)
}

impl PooledConnection {
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub async fn execute(
        &mut self,
        sql: &str,
        opts: &QueryOptions,
    ) -> Result<QueryOutput, EngineError> {
        let adapter = self
            .adapter
            .as_mut()
            .ok_or_else(|| EngineError::internal("connection already released"))?;
        match adapter.execute(sql, opts).await {
            Err(e) => {
                if matches!(e, EngineError::DbTransient(_)) {
                    self.broken = true;
                }
                Err(e)
            }
            ok => ok,
        }
    }

    pub async fn introspect(&mut self) -> Result<SchemaDescriptor, EngineError> {
        let adapter = self
            .adapter
            .as_mut()
            .ok_or_else(|| EngineError::internal("connection already released"))?;
        match adapter.introspect().await {
            Err(e) => {
                if matches!(e, EngineError::DbTransient(_)) {
                    self.broken = true;
                }
                Err(e)
            }
            ok => ok,
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.broken {
            return;
        }
        if let Some(adapter) = self.adapter.take() {
            let mut idle = self.pool.idle.lock().unwrap_or_else(|p| p.into_inner());
            idle.push(IdleConn {
                adapter,
                last_checked_at: self.last_checked_at,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;
    use crate::core::types::{ConnectionInfo, DatasourceKind, DatasourceStatus, now_iso};

    fn sqlite_datasource(path: &str) -> Datasource {
        Datasource {
            id: Uuid::new_v4(),
            name: "test-sqlite".to_string(),
            kind: DatasourceKind::Sqlite,
            connection: ConnectionInfo {
                path: Some(path.to_string()),
                ..Default::default()
            },
            status: DatasourceStatus::Active,
            is_default: true,
            last_used_at: None,
            created_at: now_iso(),
            updated_at: now_iso(),
        }
    }

    #[tokio::test]
    async fn per_datasource_cap_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.db");
        let ds = sqlite_datasource(path.to_str().unwrap());

        let manager = Arc::new(PoolManager::new(PoolConfig {
            max_total: 50,
            max_per_datasource: 10,
            acquire_timeout_ms: 100,
            health_interval_ms: 30_000,
            connect_retries: 3,
        }));

        let mut handles = Vec::new();
        for _ in 0..11 {
            let manager = manager.clone();
            let ds = ds.clone();
            handles.push(tokio::spawn(async move {
                match manager.acquire(&ds).await {
                    Ok(conn) => {
                        tokio::time::sleep(Duration::from_millis(300)).await;
                        drop(conn);
                        Ok(())
                    }
                    Err(e) => Err(e.kind()),
                }
            }));
        }

        let mut ok = 0;
        let mut exhausted = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => ok += 1,
                Err(ErrorKind::PoolExhausted) => exhausted += 1,
                Err(other) => panic!("unexpected error kind: {other:?}"),
            }
        }
        assert_eq!(ok, 10);
        assert_eq!(exhausted, 1);
    }

    #[tokio::test]
    async fn global_cap_applies_across_datasources() {
        let dir = tempfile::tempdir().unwrap();
        let ds_a = sqlite_datasource(dir.path().join("a.db").to_str().unwrap());
        let ds_b = sqlite_datasource(dir.path().join("b.db").to_str().unwrap());

        let manager = PoolManager::new(PoolConfig {
            max_total: 1,
            max_per_datasource: 10,
            acquire_timeout_ms: 100,
            health_interval_ms: 30_000,
            connect_retries: 0,
        });

        let held = manager.acquire(&ds_a).await.unwrap();
        let err = manager.acquire(&ds_b).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PoolExhausted);
        drop(held);

        manager.acquire(&ds_b).await.unwrap();
    }

    #[tokio::test]
    async fn connections_are_reused_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let ds = sqlite_datasource(dir.path().join("reuse.db").to_str().unwrap());
        let manager = PoolManager::new(PoolConfig::default());

        {
            let mut conn = manager.acquire(&ds).await.unwrap();
            conn.execute("CREATE TABLE t (x INTEGER)", &QueryOptions::default())
                .await
                .unwrap();
        }
        // The table persists on the reused connection's database.
        let mut conn = manager.acquire(&ds).await.unwrap();
        let out = conn
            .execute("SELECT COUNT(*) AS n FROM t", &QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(out.rows[0][0], serde_json::json!(0));
    }
}
