//! Memoization cache and event memory.
//!
//! The cache is a keyed singleflight: concurrent misses on one fingerprint
//! share a single producer run. The event memory is an append-only, capped
//! record of what flowed through the engine, searchable by keyword with a
//! recency boost.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;
use uuid::Uuid;

use crate::config::MemoryConfig;
use crate::core::error::EngineError;
use crate::core::store::Store;
use crate::core::types::{Scene, now_iso};

// ── Memoization cache ──

#[derive(Clone)]
struct StoredValue {
    value: serde_json::Value,
    stored_at: Instant,
    ttl: Duration,
}

pub struct MemoCache {
    entries: StdMutex<HashMap<String, Arc<OnceCell<StoredValue>>>>,
}

impl MemoCache {
    pub fn new() -> Self {
        Self {
            entries: StdMutex::new(HashMap::new()),
        }
    }

    /// Deterministic fingerprint over an operation's inputs.
    pub fn fingerprint(parts: &[&str]) -> String {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        format!("{:x}", hasher.finalize())
    }

    /// Return the cached value for `key`, or run `producer` to fill it.
    /// Expired entries are dropped before lookup, so one producer runs per
    /// key per TTL window regardless of caller count.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        producer: F,
    ) -> Result<serde_json::Value, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<serde_json::Value, EngineError>>,
    {
        let cell = {
            let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(slot) = entries.get(key)
                && let Some(stored) = slot.get()
                && stored.stored_at.elapsed() > stored.ttl
            {
                entries.remove(key);
            }
            entries
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let stored = cell
            .get_or_try_init(|| async {
                let value = producer().await?;
                Ok::<_, EngineError>(StoredValue {
                    value,
                    stored_at: Instant::now(),
                    ttl,
                })
            })
            .await?;
        Ok(stored.value.clone())
    }

    /// Drop every entry whose key starts with `prefix`. Used when a
    /// datasource's connection config changes.
    pub fn invalidate_prefix(&self, prefix: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.retain(|key, _| !key.starts_with(prefix));
    }
}

impl Default for MemoCache {
    fn default() -> Self {
        Self::new()
    }
}

// ── Event memory ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryEventType {
    TextInput,
    VoiceInput,
    FileUpload,
    ImageUpload,
    MetricAction,
    AnalysisResult,
}

impl MemoryEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            MemoryEventType::TextInput => "text_input",
            MemoryEventType::VoiceInput => "voice_input",
            MemoryEventType::FileUpload => "file_upload",
            MemoryEventType::ImageUpload => "image_upload",
            MemoryEventType::MetricAction => "metric_action",
            MemoryEventType::AnalysisResult => "analysis_result",
        }
    }

    pub fn from_str_tag(value: &str) -> Option<Self> {
        match value {
            "text_input" => Some(MemoryEventType::TextInput),
            "voice_input" => Some(MemoryEventType::VoiceInput),
            "file_upload" => Some(MemoryEventType::FileUpload),
            "image_upload" => Some(MemoryEventType::ImageUpload),
            "metric_action" => Some(MemoryEventType::MetricAction),
            "analysis_result" => Some(MemoryEventType::AnalysisResult),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEvent {
    pub id: String,
    pub ts: String,
    pub event_type: MemoryEventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scene: Option<Scene>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Per-event-type capture switches plus retention bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySettings {
    pub enabled: bool,
    pub capture_text: bool,
    pub capture_voice: bool,
    pub capture_files: bool,
    pub capture_images: bool,
    pub capture_metric_actions: bool,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            capture_text: true,
            capture_voice: true,
            capture_files: true,
            capture_images: true,
            capture_metric_actions: true,
        }
    }
}

const SETTINGS_KEY: &str = "memory_settings";

pub struct MemoryStore {
    store: Arc<Store>,
    cfg: MemoryConfig,
}

impl MemoryStore {
    pub fn new(store: Arc<Store>, cfg: MemoryConfig) -> Self {
        Self { store, cfg }
    }

    pub async fn settings(&self) -> Result<MemorySettings, EngineError> {
        match self.store.get_config(SETTINGS_KEY).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(MemorySettings::default()),
        }
    }

    pub async fn update_settings(
        &self,
        settings: &MemorySettings,
    ) -> Result<MemorySettings, EngineError> {
        self.store
            .put_config(SETTINGS_KEY, &serde_json::to_value(settings)?)
            .await?;
        Ok(settings.clone())
    }

    fn captured(settings: &MemorySettings, event_type: MemoryEventType) -> bool {
        match event_type {
            MemoryEventType::TextInput | MemoryEventType::AnalysisResult => settings.capture_text,
            MemoryEventType::VoiceInput => settings.capture_voice,
            MemoryEventType::FileUpload => settings.capture_files,
            MemoryEventType::ImageUpload => settings.capture_images,
            MemoryEventType::MetricAction => settings.capture_metric_actions,
        }
    }

    /// Record an event, honoring the capture settings. Returns whether it was
    /// actually saved.
    pub async fn record(
        &self,
        event_type: MemoryEventType,
        scene: Option<Scene>,
        user_text: Option<String>,
        result_summary: Option<String>,
        sql: Option<String>,
        metadata: serde_json::Value,
    ) -> Result<Option<MemoryEvent>, EngineError> {
        let settings = self.settings().await?;
        if !settings.enabled || !Self::captured(&settings, event_type) {
            return Ok(None);
        }
        let event = MemoryEvent {
            id: Uuid::new_v4().to_string(),
            ts: now_iso(),
            event_type,
            scene,
            user_text,
            result_summary,
            sql,
            metadata,
        };
        self.store
            .append_memory_event_row(
                &event.id,
                &event.ts,
                event.event_type.as_str(),
                event.scene.map(|s| s.as_str()),
                event.user_text.as_deref(),
                event.result_summary.as_deref(),
                event.sql.as_deref(),
                &serde_json::to_string(&event.metadata)?,
                self.cfg.max_events,
                self.cfg.retention_days,
            )
            .await?;
        Ok(Some(event))
    }

    pub async fn list(
        &self,
        limit: usize,
        scene: Option<Scene>,
        event_type: Option<MemoryEventType>,
    ) -> Result<Vec<MemoryEvent>, EngineError> {
        let rows = self
            .store
            .list_memory_event_rows(
                limit,
                scene.map(|s| s.as_str()),
                event_type.map(|t| t.as_str()),
            )
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(row_to_event)
            .collect())
    }

    /// Keyword search: exact substring match dominates, word overlap and
    /// recency fill in the rest of the score.
    pub async fn search(
        &self,
        query: &str,
        limit: usize,
        scene: Option<Scene>,
    ) -> Result<Vec<MemoryEvent>, EngineError> {
        let query = query.trim().to_lowercase();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let candidates = self.list(2_000, scene, None).await?;
        let now = chrono::Utc::now();

        let mut scored: Vec<(f64, MemoryEvent)> = Vec::new();
        for event in candidates {
            let text = event_text(&event);
            if text.is_empty() {
                continue;
            }
            let hit = if text.contains(&query) { 1.0 } else { 0.0 };
            let query_words: std::collections::HashSet<&str> = query.split_whitespace().collect();
            let text_words: std::collections::HashSet<&str> = text.split_whitespace().collect();
            let overlap = query_words.intersection(&text_words).count() as f64;

            let age_days = chrono::DateTime::parse_from_rfc3339(&event.ts)
                .map(|ts| (now - ts.with_timezone(&chrono::Utc)).num_seconds() as f64 / 86_400.0)
                .unwrap_or(365.0)
                .max(0.0);
            let recency = (1.0 - age_days / 120.0).max(0.0);

            let score = 0.55 * (hit + overlap * 0.05) + 0.45 * recency;
            if score > 0.01 {
                scored.push((score, event));
            }
        }
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        Ok(scored.into_iter().take(limit).map(|(_, e)| e).collect())
    }

    /// Format the best matches as context lines for prompt injection.
    pub async fn build_context(
        &self,
        query: &str,
        limit: usize,
        scene: Option<Scene>,
    ) -> Result<String, EngineError> {
        let hits = self.search(query, limit, scene).await?;
        let mut lines = Vec::new();
        for hit in hits {
            let text = hit
                .user_text
                .as_deref()
                .or(hit.result_summary.as_deref())
                .unwrap_or("");
            if !text.is_empty() {
                let clipped: String = text.chars().take(260).collect();
                lines.push(format!("[{}][{}] {}", hit.ts, hit.event_type.as_str(), clipped));
            }
        }
        Ok(lines.join("\n"))
    }
}

fn event_text(event: &MemoryEvent) -> String {
    let mut parts = Vec::new();
    if let Some(text) = &event.user_text {
        parts.push(text.clone());
    }
    if let Some(summary) = &event.result_summary {
        parts.push(summary.clone());
    }
    if let Some(sql) = &event.sql {
        parts.push(sql.clone());
    }
    parts.join("\n").to_lowercase()
}

#[allow(clippy::type_complexity)]
fn row_to_event(
    row: (
        String,
        String,
        String,
        Option<String>,
        Option<String>,
        Option<String>,
        Option<String>,
        String,
    ),
) -> Option<MemoryEvent> {
    let (id, ts, event_type, scene, user_text, result_summary, sql, metadata_json) = row;
    Some(MemoryEvent {
        id,
        ts,
        event_type: MemoryEventType::from_str_tag(&event_type)?,
        scene: scene.and_then(|s| match s.as_str() {
            "dashboard" => Some(Scene::Dashboard),
            "data_discuss" => Some(Scene::DataDiscuss),
            "loan_ops" => Some(Scene::LoanOps),
            _ => None,
        }),
        user_text,
        result_summary,
        sql,
        metadata: serde_json::from_str(&metadata_json).unwrap_or(serde_json::Value::Null),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn singleflight_runs_one_producer() {
        let cache = Arc::new(MemoCache::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute("schema:ds1", Duration::from_secs(60), || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(serde_json::json!({"tables": 3}))
                    })
                    .await
                    .unwrap()
            }));
        }

        let mut values = Vec::new();
        for handle in handles {
            values.push(handle.await.unwrap());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(values.iter().all(|v| v == &values[0]));
    }

    #[tokio::test]
    async fn expired_entries_recompute() {
        let cache = MemoCache::new();
        let calls = AtomicUsize::new(0);

        for _ in 0..2 {
            cache
                .get_or_compute("k", Duration::from_millis(10), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(serde_json::json!(1))
                })
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fingerprint_is_stable_and_separator_safe() {
        assert_eq!(
            MemoCache::fingerprint(&["a", "bc"]),
            MemoCache::fingerprint(&["a", "bc"])
        );
        assert_ne!(
            MemoCache::fingerprint(&["ab", "c"]),
            MemoCache::fingerprint(&["a", "bc"])
        );
    }

    #[tokio::test]
    async fn memory_search_prefers_matching_and_recent() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let memory = MemoryStore::new(store, MemoryConfig::default());

        memory
            .record(
                MemoryEventType::AnalysisResult,
                Some(Scene::Dashboard),
                Some("monthly revenue by product".to_string()),
                Some("returned 12 rows".to_string()),
                Some("SELECT product, SUM(revenue) FROM orders GROUP BY product".to_string()),
                serde_json::Value::Null,
            )
            .await
            .unwrap();
        memory
            .record(
                MemoryEventType::TextInput,
                Some(Scene::Dashboard),
                Some("weather in berlin".to_string()),
                None,
                None,
                serde_json::Value::Null,
            )
            .await
            .unwrap();

        let hits = memory.search("revenue", 10, None).await.unwrap();
        assert!(!hits.is_empty());
        assert!(hits[0].user_text.as_deref().unwrap().contains("revenue"));

        let context = memory.build_context("revenue", 3, None).await.unwrap();
        assert!(context.contains("monthly revenue"));
    }

    #[tokio::test]
    async fn capture_toggles_are_honored() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let memory = MemoryStore::new(store, MemoryConfig::default());
        memory
            .update_settings(&MemorySettings {
                capture_text: false,
                ..Default::default()
            })
            .await
            .unwrap();

        let saved = memory
            .record(
                MemoryEventType::TextInput,
                None,
                Some("hello".to_string()),
                None,
                None,
                serde_json::Value::Null,
            )
            .await
            .unwrap();
        assert!(saved.is_none());
    }
}
