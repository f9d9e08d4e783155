//! Prompt templates for the specialist agents, plus the JSON block extractor
//! used to post-process provider replies.

/// Extract a JSON block from LLM output. Tries fenced ```json ... ``` first,
/// then raw JSON starting with `{` or `[`.
pub fn extract_json_block(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```json") {
        let content_start = start + 7;
        if let Some(end) = trimmed[content_start..].find("```") {
            let block = trimmed[content_start..content_start + end].trim();
            if !block.is_empty() {
                return Some(block);
            }
        }
    }
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return Some(trimmed);
    }
    None
}

pub const SQL_SYSTEM_PROMPT: &str = "\
You are a senior data analyst that turns business questions into SQL.\n\
Output ONLY a JSON object, no prose around it, with this shape:\n\
{\n\
  \"intent\": \"answer\" | \"clarification\",\n\
  \"sql\": \"<single SELECT statement>\" | null,\n\
  \"should_visualize\": true | false,\n\
  \"answer\": \"<assistant reply for small talk, else null>\",\n\
  \"clarification\": {\"question\": \"...\", \"options\": [\"...\"]} | null\n\
}\n\
Rules:\n\
- Use ONLY tables and columns from the provided schema.\n\
- One statement, no trailing semicolon stacking, no DDL.\n\
- If the question is under-specified (no metric, no time window, ambiguous\n\
  entity), set intent=clarification, ask ONE follow-up question and offer at\n\
  most 4 concrete options.\n\
- If the question is a greeting or a help request, set intent=answer with\n\
  sql=null and put the reply text in \"answer\".\n\
- Write SQL in the dialect named in the request.";

pub fn sql_user_prompt(
    question: &str,
    schema_json: &str,
    dialect: &str,
    memory_context: &str,
) -> String {
    let mut parts = vec![
        format!("## Question\n{question}"),
        format!("## Dialect\n{dialect}"),
        format!("## Schema\n{schema_json}"),
    ];
    if !memory_context.is_empty() {
        parts.push(format!("## Recent context\n{memory_context}"));
    }
    parts.join("\n\n")
}

pub fn correction_user_prompt(
    question: &str,
    schema_json: &str,
    dialect: &str,
    previous_sql: &str,
    engine_error: &str,
) -> String {
    format!(
        "The previous SQL failed. Produce a corrected statement.\n\n\
         ## Question\n{question}\n\n\
         ## Dialect\n{dialect}\n\n\
         ## Schema\n{schema_json}\n\n\
         ## Failed SQL\n{previous_sql}\n\n\
         ## Engine error\n{engine_error}\n\n\
         Return the same JSON shape as before, with intent=answer and the\n\
         corrected statement in \"sql\". Do not repeat the failed SQL."
    )
}

pub const VISUALIZE_SYSTEM_PROMPT: &str = "\
You design a single chart for a tabular query result.\n\
Output ONLY a JSON object:\n\
{\n\
  \"chart_type\": \"bar\" | \"line\" | \"pie\" | \"table\",\n\
  \"spec\": { \"x\": \"<column>\", \"y\": \"<column>\", \"series\": \"<column or null>\" },\n\
  \"insight\": {\"summary\": \"...\", \"key_points\": [\"...\"]}\n\
}\n\
Pick the categorical column for x and the numeric column for y. Prefer bar\n\
for rankings, line for time series, pie only for shares across few slices.";

pub fn visualize_user_prompt(question: &str, columns_json: &str, sample_json: &str) -> String {
    format!(
        "## Question\n{question}\n\n## Columns\n{columns_json}\n\n## Data sample\n{sample_json}"
    )
}

/// Prompt for one execution task, carrying upstream outputs as context. The
/// full original question is summarized into the objective on purpose so the
/// agent stays inside its task.
pub fn task_user_prompt(
    title: &str,
    objective: &str,
    question: &str,
    prior_outputs: &[(String, String)],
) -> String {
    let mut parts = vec![
        format!("# YOUR TASK: {title}"),
        "You are responsible for THIS TASK ONLY; other tasks run separately.".to_string(),
        format!("## Objective\n{objective}"),
        format!("## Original question\n{question}"),
    ];
    if !prior_outputs.is_empty() {
        parts.push("## Prior task outputs".to_string());
        for (task_id, output) in prior_outputs {
            parts.push(format!("[{task_id}]\n{output}"));
        }
    }
    parts.join("\n\n")
}

pub const TASK_SYSTEM_PROMPT: &str = "\
You are one specialist in a multi-agent analysis workflow over loan-book\n\
data. Complete the task you are given and reply with a concise, actionable\n\
result. If the task needs an external approval before it can proceed, reply\n\
with the single marker AWAITING_APPROVAL and nothing else.";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_fenced_block() {
        let text = "Preamble\n```json\n{\"key\": \"value\"}\n```\nPostamble";
        assert_eq!(extract_json_block(text), Some("{\"key\": \"value\"}"));
    }

    #[test]
    fn extract_raw_object_and_array() {
        assert_eq!(extract_json_block("{\"a\": 1}"), Some("{\"a\": 1}"));
        assert_eq!(extract_json_block("[1, 2]"), Some("[1, 2]"));
    }

    #[test]
    fn extract_none_for_prose() {
        assert!(extract_json_block("Just words").is_none());
        assert!(extract_json_block("").is_none());
    }

    #[test]
    fn task_prompt_includes_prior_outputs() {
        let prompt = task_user_prompt(
            "风险评估",
            "assess overdue drivers",
            "why did overdue rise",
            &[("task_1".to_string(), "overdue up 12bp".to_string())],
        );
        assert!(prompt.contains("风险评估"));
        assert!(prompt.contains("task_1"));
        assert!(prompt.contains("overdue up 12bp"));
        assert!(prompt.contains("THIS TASK ONLY"));
    }
}
