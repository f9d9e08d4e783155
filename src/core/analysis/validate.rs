//! Draft-SQL hygiene: fence stripping, refusal detection, single-statement
//! enforcement, scene write policy and the row-limit ceiling. Deliberately
//! heuristic; the engine carries no SQL parser of its own.

use regex::Regex;
use std::sync::OnceLock;

use crate::core::error::EngineError;

const READ_STARTERS: &[&str] = &["SELECT", "WITH", "SHOW", "EXPLAIN", "DESC", "DESCRIBE"];
const WRITE_STARTERS: &[&str] = &["INSERT", "UPDATE", "DELETE"];

// Markers the model emits instead of SQL when it gives up.
const REFUSAL_MARKERS: &[&str] = &[
    "UNABLE TO",
    "CANNOT GENERATE",
    "CAN'T GENERATE",
    "NOT ENOUGH",
    "INSUFFICIENT",
    "无法生成",
];

/// Strip markdown fences and leading `--` comment lines.
pub fn sanitize(sql: &str) -> String {
    let mut cleaned = sql
        .replace("```sql", "")
        .replace("```", "")
        .trim()
        .to_string();
    while cleaned.starts_with("--") {
        match cleaned.split_once('\n') {
            Some((_, rest)) => cleaned = rest.trim().to_string(),
            None => {
                cleaned.clear();
                break;
            }
        }
    }
    cleaned.trim().trim_end_matches(';').trim().to_string()
}

/// Validate a sanitized draft. Returns the statement ready for execution.
pub fn validate(sql: &str, read_only: bool) -> Result<String, EngineError> {
    let cleaned = sanitize(sql);
    if cleaned.is_empty() {
        return Err(EngineError::Validation(
            "draft SQL is empty after cleanup".to_string(),
        ));
    }

    let upper = cleaned.to_uppercase();
    if REFUSAL_MARKERS.iter().any(|m| upper.contains(m)) {
        return Err(EngineError::Validation(
            "provider declined to generate SQL for this question".to_string(),
        ));
    }

    if has_statement_separator(&cleaned) {
        return Err(EngineError::Validation(
            "multi-statement SQL is not allowed".to_string(),
        ));
    }

    let head = upper
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_string();
    if READ_STARTERS.contains(&head.as_str()) {
        return Ok(cleaned);
    }
    if WRITE_STARTERS.contains(&head.as_str()) {
        if read_only {
            return Err(EngineError::Validation(format!(
                "{head} statements are not allowed in a read-only scene"
            )));
        }
        return Ok(cleaned);
    }
    Err(EngineError::Validation(format!(
        "statement head '{head}' is not allowed"
    )))
}

/// Append a LIMIT when the statement has none. The check is textual;
/// client-side truncation in the adapter is the real ceiling.
pub fn apply_row_limit(sql: &str, max_rows: usize) -> String {
    static LIMIT_RE: OnceLock<Regex> = OnceLock::new();
    let re = LIMIT_RE.get_or_init(|| Regex::new(r"(?i)\blimit\s+\d+").expect("static regex"));

    let head = sql
        .to_uppercase()
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_string();
    if !matches!(head.as_str(), "SELECT" | "WITH") || re.is_match(sql) {
        return sql.to_string();
    }
    format!("{sql} LIMIT {max_rows}")
}

// A separator is a ';' with anything non-whitespace after it, outside string
// literals.
fn has_statement_separator(sql: &str) -> bool {
    let mut in_single = false;
    let mut in_double = false;
    for (idx, ch) in sql.char_indices() {
        match ch {
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            ';' if !in_single && !in_double => {
                if sql[idx + 1..].trim().is_empty() {
                    return false;
                }
                return true;
            }
            _ => {}
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;

    #[test]
    fn sanitize_strips_fences_and_comments() {
        assert_eq!(
            sanitize("```sql\n-- top products\nSELECT 1;\n```"),
            "SELECT 1"
        );
        assert_eq!(sanitize("-- only a comment"), "");
    }

    #[test]
    fn multi_statement_rejected() {
        let err = validate("SELECT 1; DROP TABLE users", true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        // Semicolon inside a literal is fine.
        assert!(validate("SELECT 'a;b' AS v", true).is_ok());
    }

    #[test]
    fn write_policy_follows_scene() {
        assert!(validate("UPDATE t SET x = 1", false).is_ok());
        assert!(validate("UPDATE t SET x = 1", true).is_err());
        assert!(validate("DROP TABLE t", false).is_err());
    }

    #[test]
    fn refusal_prose_is_rejected() {
        let err = validate("I am unable to generate SQL for this", true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn limit_injection() {
        assert_eq!(
            apply_row_limit("SELECT * FROM t", 100),
            "SELECT * FROM t LIMIT 100"
        );
        assert_eq!(
            apply_row_limit("SELECT * FROM t LIMIT 5", 100),
            "SELECT * FROM t LIMIT 5"
        );
        assert_eq!(apply_row_limit("SHOW TABLES", 100), "SHOW TABLES");
    }
}
