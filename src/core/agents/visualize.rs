//! VisualizeAgent: turns a query result into a chart spec plus an optional
//! insight summary. Pure function of its inputs apart from the provider call.

use std::sync::Arc;

use tracing::warn;

use crate::core::db::QueryColumn;
use crate::core::error::EngineError;
use crate::core::types::{ChartSpec, Insight, Scene};

use super::prompts;
use super::{AgentProfile, AgentRuntime};

const SAMPLE_ROWS: usize = 3;

pub struct VisualizeAgent {
    runtime: Arc<AgentRuntime>,
}

impl VisualizeAgent {
    pub fn new(runtime: Arc<AgentRuntime>) -> Self {
        Self { runtime }
    }

    pub async fn chart(
        &self,
        profile: &AgentProfile,
        scene: Scene,
        question: &str,
        columns: &[QueryColumn],
        rows: &[Vec<serde_json::Value>],
        timeout_ms: u64,
    ) -> Result<(Option<ChartSpec>, Option<Insight>), EngineError> {
        let columns_json = serde_json::to_string(columns)?;
        let sample: Vec<_> = rows.iter().take(SAMPLE_ROWS).collect();
        let sample_json = serde_json::to_string(&sample)?;
        let user = prompts::visualize_user_prompt(question, &columns_json, &sample_json);

        let message = self
            .runtime
            .invoke(
                profile,
                scene,
                "visualize",
                prompts::VISUALIZE_SYSTEM_PROMPT,
                &user,
                timeout_ms,
            )
            .await?;

        let Some(data) = message.data else {
            warn!("visualize agent returned no structured config");
            return Ok((None, None));
        };

        let chart = data
            .get("chart_type")
            .and_then(|v| v.as_str())
            .map(|chart_type| ChartSpec {
                chart_type: chart_type.to_string(),
                spec: data.get("spec").cloned().unwrap_or(serde_json::Value::Null),
            });

        let insight = data.get("insight").and_then(|i| {
            Some(Insight {
                summary: i.get("summary")?.as_str()?.to_string(),
                key_points: i
                    .get("key_points")
                    .and_then(|k| k.as_array())
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|v| v.as_str().map(|s| s.to_string()))
                            .collect()
                    })
                    .unwrap_or_default(),
            })
        });

        Ok((chart, insight))
    }
}

/// A result is chartable when it has at least one categorical and one
/// numeric column and more than one row.
pub fn worth_charting(columns: &[QueryColumn], rows: &[Vec<serde_json::Value>]) -> bool {
    if rows.len() < 2 || columns.is_empty() {
        return false;
    }
    let first = &rows[0];
    let mut has_categorical = false;
    let mut has_numeric = false;
    for (idx, _) in columns.iter().enumerate() {
        match first.get(idx) {
            Some(serde_json::Value::Number(_)) => has_numeric = true,
            Some(serde_json::Value::String(_)) => has_categorical = true,
            _ => {}
        }
    }
    has_categorical && has_numeric
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(names: &[&str]) -> Vec<QueryColumn> {
        names
            .iter()
            .map(|n| QueryColumn {
                name: n.to_string(),
                data_type: "TEXT".to_string(),
            })
            .collect()
    }

    #[test]
    fn chartable_needs_both_column_kinds() {
        let columns = cols(&["product", "revenue"]);
        let rows = vec![
            vec![serde_json::json!("widget"), serde_json::json!(10.5)],
            vec![serde_json::json!("gadget"), serde_json::json!(8.0)],
        ];
        assert!(worth_charting(&columns, &rows));

        let numeric_only = vec![
            vec![serde_json::json!(1), serde_json::json!(2)],
            vec![serde_json::json!(3), serde_json::json!(4)],
        ];
        assert!(!worth_charting(&columns, &numeric_only));
    }

    #[test]
    fn single_row_is_not_charted() {
        let columns = cols(&["product", "revenue"]);
        let rows = vec![vec![serde_json::json!("widget"), serde_json::json!(1)]];
        assert!(!worth_charting(&columns, &rows));
    }
}
