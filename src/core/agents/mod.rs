//! Agent runtime: renders prompts, invokes the bound language provider with
//! bounded retry, post-processes replies into [`AgentMessage`] and emits a
//! structured step log for every call.

pub mod prompts;
pub mod schema;
pub mod sql;
pub mod visualize;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::error::EngineError;
use crate::core::llm::{ChatMessage, CompletionOptions, LlmRouter};
use crate::core::store::Store;
use crate::core::types::{AgentMessage, MessageIntent, MessageRole, Scene, StepLog, now_iso};

pub use schema::SchemaAgent;
pub use sql::{SqlAgent, SqlDraft};
pub use visualize::VisualizeAgent;

const LLM_RETRIES: u32 = 2;
const LLM_RETRY_BASE_MS: u64 = 250;

/// Per-profile tool switches.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AgentFeatures {
    pub sql_tool: bool,
    pub rag_tool: bool,
    pub rule_validation: bool,
}

impl Default for AgentFeatures {
    fn default() -> Self {
        Self {
            sql_tool: true,
            rag_tool: false,
            rule_validation: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_binding_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub features: AgentFeatures,
}

impl AgentProfile {
    pub fn named(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            llm_binding_id: None,
            system_prompt: None,
            features: AgentFeatures::default(),
        }
    }
}

pub struct AgentRuntime {
    router: Arc<LlmRouter>,
    store: Arc<Store>,
}

impl AgentRuntime {
    pub fn new(router: Arc<LlmRouter>, store: Arc<Store>) -> Self {
        Self { router, store }
    }

    pub fn router(&self) -> &Arc<LlmRouter> {
        &self.router
    }

    /// One provider round-trip. `LLM_UNAVAILABLE` is retried with a short
    /// backoff; everything else surfaces as-is.
    pub async fn invoke(
        &self,
        profile: &AgentProfile,
        scene: Scene,
        step: &str,
        system: &str,
        user: &str,
        timeout_ms: u64,
    ) -> Result<AgentMessage, EngineError> {
        let provider = self
            .router
            .resolve(profile.llm_binding_id.as_deref(), scene)?;

        let mut messages = Vec::with_capacity(2);
        let system_text = match &profile.system_prompt {
            Some(extra) => format!("{system}\n\n{extra}"),
            None => system.to_string(),
        };
        messages.push(ChatMessage::system(system_text));
        messages.push(ChatMessage::user(user));

        let opts = CompletionOptions {
            timeout_ms,
            temperature: None,
        };

        let mut attempt = 0;
        let outcome = loop {
            match provider.complete(&messages, &opts).await {
                Ok(output) => break Ok(output),
                Err(e) if matches!(e, EngineError::LlmUnavailable(_)) && attempt < LLM_RETRIES => {
                    attempt += 1;
                    warn!(step, attempt, error = %e, "provider unavailable, retrying");
                    tokio::time::sleep(Duration::from_millis(
                        LLM_RETRY_BASE_MS * 2u64.pow(attempt - 1),
                    ))
                    .await;
                }
                Err(e) => break Err(e),
            }
        };

        let log = |status: &str, detail: String| StepLog {
            execution_id: None,
            profile_id: Some(profile.id.clone()),
            step: step.to_string(),
            status: status.to_string(),
            detail,
            metadata: serde_json::json!({ "attempts": attempt + 1 }),
            ts: now_iso(),
        };

        match outcome {
            Ok(output) => {
                let message = parse_reply(&output.text);
                debug!(step, intent = ?message.intent, "agent call completed");
                let detail: String = output.text.chars().take(400).collect();
                self.store.append_step_log(&log("success", detail)).await?;
                Ok(message)
            }
            Err(e) => {
                self.store.append_step_log(&log("error", e.to_string())).await?;
                Err(e)
            }
        }
    }
}

/// Permissive first pass over a provider reply. A JSON object (fenced or
/// raw) becomes structured `data`; the fields the engine does not model stay
/// in `metadata`.
pub(crate) fn parse_reply(text: &str) -> AgentMessage {
    let parsed = prompts::extract_json_block(text)
        .and_then(|block| serde_json::from_str::<serde_json::Value>(block).ok());

    match parsed {
        Some(serde_json::Value::Object(obj)) => {
            let intent = match obj.get("intent").and_then(|v| v.as_str()) {
                Some("clarification") => MessageIntent::Clarification,
                Some("error") => MessageIntent::Error,
                _ => MessageIntent::Answer,
            };
            let content = obj
                .get("content")
                .or_else(|| obj.get("answer"))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .unwrap_or_else(|| text.trim().to_string());

            let mut metadata = serde_json::Map::new();
            for (key, value) in &obj {
                if !matches!(key.as_str(), "intent" | "content") {
                    metadata.insert(key.clone(), value.clone());
                }
            }

            AgentMessage {
                role: MessageRole::Assistant,
                content,
                data: Some(serde_json::Value::Object(obj)),
                intent,
                metadata,
            }
        }
        _ => AgentMessage {
            role: MessageRole::Assistant,
            content: text.trim().to_string(),
            data: None,
            intent: MessageIntent::Answer,
            metadata: serde_json::Map::new(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::llm::MockProvider;

    #[test]
    fn parse_reply_plain_text() {
        let msg = parse_reply("SELECT 1");
        assert_eq!(msg.intent, MessageIntent::Answer);
        assert_eq!(msg.content, "SELECT 1");
        assert!(msg.data.is_none());
    }

    #[test]
    fn parse_reply_structured_clarification() {
        let msg = parse_reply(
            r#"{"intent": "clarification", "content": "Which time window?",
                "options": ["today", "last 7 days"], "reasoning": "no window given"}"#,
        );
        assert_eq!(msg.intent, MessageIntent::Clarification);
        assert_eq!(msg.content, "Which time window?");
        assert_eq!(msg.metadata["reasoning"], "no window given");
        assert!(msg.data.is_some());
    }

    #[test]
    fn parse_reply_fenced_json() {
        let msg = parse_reply("Here you go:\n```json\n{\"sql\": \"SELECT 1\"}\n```");
        let data = msg.data.unwrap();
        assert_eq!(data["sql"], "SELECT 1");
    }

    #[tokio::test]
    async fn invoke_retries_on_unavailable() {
        let router = Arc::new(LlmRouter::new());
        let provider = Arc::new(MockProvider::new());
        provider.push_failure(EngineError::LlmUnavailable("503".to_string()));
        provider.push_reply("{\"sql\": \"SELECT 1\"}");
        router.register("main", provider);

        let store = Arc::new(crate::core::store::Store::open_in_memory().unwrap());
        let runtime = AgentRuntime::new(router, store.clone());
        let profile = AgentProfile::named("sql-agent");

        let msg = runtime
            .invoke(&profile, Scene::DataDiscuss, "sql_draft", "sys", "user", 5_000)
            .await
            .unwrap();
        assert_eq!(msg.data.unwrap()["sql"], "SELECT 1");

        let logs = store.list_step_logs(None, 10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, "success");
        assert_eq!(logs[0].metadata["attempts"], 2);
    }
}
