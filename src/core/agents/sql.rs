//! SqlAgent: drafts SQL for a question against a schema summary, corrects a
//! failed statement given the engine error, and asks for clarification when
//! the question is under-specified.

use std::sync::Arc;

use crate::core::error::EngineError;
use crate::core::types::{AgentMessage, Clarification, MessageIntent, Scene, SchemaDescriptor};

use super::prompts;
use super::{AgentProfile, AgentRuntime};

const MAX_CLARIFICATION_OPTIONS: usize = 4;

#[derive(Debug, Clone)]
pub struct SqlDraft {
    pub intent: MessageIntent,
    pub sql: Option<String>,
    pub should_visualize: bool,
    pub clarification: Option<Clarification>,
    /// Direct assistant reply for greeting/help questions.
    pub answer: Option<String>,
    pub raw: AgentMessage,
}

pub struct SqlAgent {
    runtime: Arc<AgentRuntime>,
}

impl SqlAgent {
    pub fn new(runtime: Arc<AgentRuntime>) -> Self {
        Self { runtime }
    }

    pub async fn draft(
        &self,
        profile: &AgentProfile,
        scene: Scene,
        question: &str,
        schema: &SchemaDescriptor,
        memory_context: &str,
        timeout_ms: u64,
    ) -> Result<SqlDraft, EngineError> {
        let schema_json = serde_json::to_string(schema)?;
        let user = prompts::sql_user_prompt(question, &schema_json, &schema.dialect, memory_context);
        let message = self
            .runtime
            .invoke(
                profile,
                scene,
                "sql_draft",
                prompts::SQL_SYSTEM_PROMPT,
                &user,
                timeout_ms,
            )
            .await?;
        Ok(parse_draft(message))
    }

    pub async fn correct(
        &self,
        profile: &AgentProfile,
        scene: Scene,
        question: &str,
        schema: &SchemaDescriptor,
        previous_sql: &str,
        engine_error: &str,
        timeout_ms: u64,
    ) -> Result<SqlDraft, EngineError> {
        let schema_json = serde_json::to_string(schema)?;
        let user = prompts::correction_user_prompt(
            question,
            &schema_json,
            &schema.dialect,
            previous_sql,
            engine_error,
        );
        let message = self
            .runtime
            .invoke(
                profile,
                scene,
                "sql_correction",
                prompts::SQL_SYSTEM_PROMPT,
                &user,
                timeout_ms,
            )
            .await?;
        Ok(parse_draft(message))
    }
}

/// Fold a provider reply into a draft. Structured JSON is preferred; a bare
/// text reply is treated as the SQL itself after stripping markdown fences.
pub(crate) fn parse_draft(message: AgentMessage) -> SqlDraft {
    let data = message.data.clone().unwrap_or(serde_json::Value::Null);

    let clarification = data.get("clarification").and_then(|c| {
        let question = c.get("question")?.as_str()?.to_string();
        let options = c
            .get("options")
            .and_then(|o| o.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .take(MAX_CLARIFICATION_OPTIONS)
                    .collect()
            })
            .unwrap_or_default();
        Some(Clarification { question, options })
    });

    let intent = if message.intent == MessageIntent::Clarification || clarification.is_some() {
        MessageIntent::Clarification
    } else {
        message.intent
    };

    let sql = data
        .get("sql")
        .and_then(|v| v.as_str())
        .map(strip_fences)
        .filter(|s| !s.is_empty())
        .or_else(|| {
            if message.data.is_none() && intent == MessageIntent::Answer {
                let candidate = strip_fences(&message.content);
                (!candidate.is_empty()).then_some(candidate)
            } else {
                None
            }
        });

    let answer = data
        .get("answer")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .filter(|s| !s.is_empty());

    let should_visualize = data
        .get("should_visualize")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    SqlDraft {
        intent,
        sql,
        should_visualize,
        clarification,
        answer,
        raw: message,
    }
}

pub(crate) fn strip_fences(text: &str) -> String {
    text.replace("```sql", "")
        .replace("```", "")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::agents::parse_reply;

    #[test]
    fn structured_answer_draft() {
        let draft = parse_draft(parse_reply(
            r#"{"intent": "answer", "sql": "SELECT name FROM products LIMIT 5",
                "should_visualize": true, "answer": null, "clarification": null}"#,
        ));
        assert_eq!(draft.intent, MessageIntent::Answer);
        assert_eq!(draft.sql.as_deref(), Some("SELECT name FROM products LIMIT 5"));
        assert!(draft.should_visualize);
        assert!(draft.clarification.is_none());
    }

    #[test]
    fn clarification_draft_caps_options() {
        let draft = parse_draft(parse_reply(
            r#"{"intent": "clarification", "sql": null,
                "clarification": {"question": "Which time window?",
                "options": ["today", "last 7 days", "last 30 days", "custom", "extra"]}}"#,
        ));
        assert_eq!(draft.intent, MessageIntent::Clarification);
        let clarification = draft.clarification.unwrap();
        assert_eq!(clarification.question, "Which time window?");
        assert_eq!(clarification.options.len(), 4);
        assert!(draft.sql.is_none());
    }

    #[test]
    fn bare_text_reply_is_treated_as_sql() {
        let draft = parse_draft(parse_reply("```sql\nSELECT 1\n```"));
        assert_eq!(draft.sql.as_deref(), Some("SELECT 1"));
    }

    #[test]
    fn greeting_answer_carries_no_sql() {
        let draft = parse_draft(parse_reply(
            r#"{"intent": "answer", "sql": null,
                "answer": "Hello! Ask me about your data."}"#,
        ));
        assert!(draft.sql.is_none());
        assert_eq!(draft.answer.as_deref(), Some("Hello! Ask me about your data."));
    }
}
