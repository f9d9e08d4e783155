use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level engine configuration. Every knob has a documented default; a
/// zeroed-out config is never valid, so construction goes through `Default`
/// and field overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory holding the engine's own sqlite store.
    pub data_dir: PathBuf,
    pub pool: PoolConfig,
    pub analyze: AnalyzeConfig,
    pub monitoring: MonitoringConfig,
    pub execution: ExecutionConfig,
    pub memory: MemoryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./datapilot-data"),
            pool: PoolConfig::default(),
            analyze: AnalyzeConfig::default(),
            monitoring: MonitoringConfig::default(),
            execution: ExecutionConfig::default(),
            memory: MemoryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Process-wide connection ceiling.
    pub max_total: usize,
    /// Per-datasource connection ceiling.
    pub max_per_datasource: usize,
    /// How long an acquire may wait before failing with `POOL_EXHAUSTED`.
    pub acquire_timeout_ms: u64,
    /// Idle connections older than this get a probe before hand-out.
    pub health_interval_ms: u64,
    /// Connection open attempts before giving up.
    pub connect_retries: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_total: 50,
            max_per_datasource: 10,
            acquire_timeout_ms: 5_000,
            health_interval_ms: 30_000,
            connect_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzeConfig {
    /// Bounded SQL correction attempts after the first failure.
    pub max_correction_attempts: u32,
    /// End-to-end cap for one `analyze` call, propagated into LLM and SQL calls.
    pub end_to_end_timeout_ms: u64,
}

impl Default for AnalyzeConfig {
    fn default() -> Self {
        Self {
            max_correction_attempts: 3,
            end_to_end_timeout_ms: 120_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Period of the monitoring control loop.
    pub tick_interval_ms: u64,
    /// A firing rule with an unacknowledged alert younger than this is suppressed.
    pub suppression_ms: u64,
    /// Notification dispatch attempts per alert.
    pub notify_retries: u32,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 60_000,
            suppression_ms: 900_000,
            notify_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Attempts per task before it stays `failed`.
    pub max_attempts_per_task: u32,
    /// Ceiling on `run()` steps regardless of the caller's `max_steps`.
    pub step_cap: u32,
    /// Backoff cap for task retries.
    pub retry_backoff_cap_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_attempts_per_task: 3,
            step_cap: 30,
            retry_backoff_cap_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Hard cap on retained memory events.
    pub max_events: usize,
    /// Events older than this are pruned on write.
    pub retention_days: i64,
    /// TTL for memoized schema summaries.
    pub schema_cache_ttl_ms: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_events: 50_000,
            retention_days: 90,
            schema_cache_ttl_ms: 300_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.pool.max_total, 50);
        assert_eq!(cfg.pool.max_per_datasource, 10);
        assert_eq!(cfg.pool.acquire_timeout_ms, 5_000);
        assert_eq!(cfg.analyze.max_correction_attempts, 3);
        assert_eq!(cfg.monitoring.suppression_ms, 900_000);
        assert_eq!(cfg.execution.step_cap, 30);
        assert_eq!(cfg.memory.max_events, 50_000);
    }

    #[test]
    fn config_round_trips_through_serde() {
        let cfg = EngineConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.pool.health_interval_ms, cfg.pool.health_interval_ms);
        assert_eq!(back.monitoring.tick_interval_ms, cfg.monitoring.tick_interval_ms);
    }
}
