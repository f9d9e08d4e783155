//! SchemaAgent: introspects a datasource and returns the slice of the schema
//! plausibly relevant to the question. Pure heuristic (token overlap plus
//! foreign-key proximity), memoized per `(datasource, question digest)`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::core::db::pool::PoolManager;
use crate::core::error::EngineError;
use crate::core::memory::MemoCache;
use crate::core::types::{Datasource, SchemaDescriptor, TableDescriptor};

const MAX_TABLES: usize = 8;

pub struct SchemaAgent {
    pool: Arc<PoolManager>,
    cache: Arc<MemoCache>,
    ttl: Duration,
}

impl SchemaAgent {
    pub fn new(pool: Arc<PoolManager>, cache: Arc<MemoCache>, ttl: Duration) -> Self {
        Self { pool, cache, ttl }
    }

    pub async fn relevant_schema(
        &self,
        datasource: &Datasource,
        question: Option<&str>,
    ) -> Result<SchemaDescriptor, EngineError> {
        let question_digest = MemoCache::fingerprint(&[question.unwrap_or("")]);
        let key = format!("schema:{}:{}", datasource.id, question_digest);

        let pool = self.pool.clone();
        let datasource = datasource.clone();
        let question = question.map(|q| q.to_string());
        let value = self
            .cache
            .get_or_compute(&key, self.ttl, || async move {
                let mut conn = pool.acquire(&datasource).await?;
                let schema = conn.introspect().await?;
                let filtered = match question.as_deref() {
                    Some(q) => filter_relevant(schema, q),
                    None => schema,
                };
                Ok(serde_json::to_value(filtered)?)
            })
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Drop cached summaries for a datasource, e.g. after its connection
    /// config changed.
    pub fn invalidate(&self, datasource_id: &uuid::Uuid) {
        self.cache.invalidate_prefix(&format!("schema:{datasource_id}"));
    }
}

/// Rank tables by question-token overlap, then pull in foreign-key neighbors
/// of whatever matched. Falls back to the full schema when nothing matches;
/// an empty summary would leave the SQL agent blind.
fn filter_relevant(schema: SchemaDescriptor, question: &str) -> SchemaDescriptor {
    let tokens: HashSet<String> = question
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|w| w.len() > 2)
        .map(normalize)
        .collect();
    if tokens.is_empty() {
        return schema;
    }

    let mut scored: Vec<(i64, &TableDescriptor)> = schema
        .tables
        .iter()
        .map(|table| (score_table(table, &tokens), table))
        .filter(|(score, _)| *score > 0)
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.name.cmp(&b.1.name)));

    let mut selected: HashSet<String> = scored
        .iter()
        .take(MAX_TABLES)
        .map(|(_, t)| t.name.clone())
        .collect();
    if selected.is_empty() {
        debug!("no table matched the question tokens, returning full schema");
        return schema;
    }

    // Foreign-key proximity: a join partner of a selected table is relevant
    // even when no question token names it.
    let mut neighbors: HashSet<String> = HashSet::new();
    for table in &schema.tables {
        for column in &table.columns {
            if let Some(fk) = &column.foreign_key {
                if selected.contains(&table.name) {
                    neighbors.insert(fk.table.clone());
                }
                if selected.contains(&fk.table) {
                    neighbors.insert(table.name.clone());
                }
            }
        }
    }
    selected.extend(neighbors);

    let tables = schema
        .tables
        .into_iter()
        .filter(|t| selected.contains(&t.name))
        .collect();
    SchemaDescriptor {
        tables,
        dialect: schema.dialect,
    }
}

fn score_table(table: &TableDescriptor, tokens: &HashSet<String>) -> i64 {
    let table_token = normalize(&table.name.to_lowercase());
    let mut score = 0;
    for token in tokens {
        if table_token == *token {
            score += 4;
        } else if table_token.contains(token.as_str()) || token.contains(&table_token) {
            score += 2;
        }
        for column in &table.columns {
            let column_token = normalize(&column.name.to_lowercase());
            if column_token == *token {
                score += 2;
            } else if column_token.contains(token.as_str()) {
                score += 1;
            }
        }
    }
    score
}

// Naive singular/plural folding: enough for table-vs-question matching.
fn normalize(word: impl AsRef<str>) -> String {
    let word = word.as_ref();
    word.strip_suffix('s').unwrap_or(word).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ColumnDescriptor, ForeignKeyRef};

    fn table(name: &str, columns: &[(&str, Option<(&str, &str)>)]) -> TableDescriptor {
        TableDescriptor {
            name: name.to_string(),
            columns: columns
                .iter()
                .map(|(col, fk)| ColumnDescriptor {
                    name: col.to_string(),
                    data_type: "text".to_string(),
                    nullable: true,
                    primary_key: false,
                    foreign_key: fk.map(|(t, c)| ForeignKeyRef {
                        table: t.to_string(),
                        column: c.to_string(),
                    }),
                })
                .collect(),
            row_count: None,
        }
    }

    fn sample_schema() -> SchemaDescriptor {
        SchemaDescriptor {
            tables: vec![
                table(
                    "orders",
                    &[
                        ("id", None),
                        ("product_id", Some(("products", "id"))),
                        ("revenue", None),
                        ("ordered_at", None),
                    ],
                ),
                table("products", &[("id", None), ("name", None)]),
                table("employees", &[("id", None), ("salary", None)]),
            ],
            dialect: "sqlite".to_string(),
        }
    }

    #[test]
    fn question_tokens_select_tables_and_fk_neighbors() {
        let filtered = filter_relevant(sample_schema(), "top 5 products by revenue last 30d");
        let names: Vec<_> = filtered.tables.iter().map(|t| t.name.as_str()).collect();
        assert!(names.contains(&"orders"));
        assert!(names.contains(&"products"));
        assert!(!names.contains(&"employees"));
    }

    #[test]
    fn unmatched_question_falls_back_to_full_schema() {
        let filtered = filter_relevant(sample_schema(), "something entirely unrelated");
        assert_eq!(filtered.tables.len(), 3);
    }

    #[test]
    fn fk_neighbor_is_included_when_only_parent_matches() {
        let filtered = filter_relevant(sample_schema(), "revenue per order");
        let names: Vec<_> = filtered.tables.iter().map(|t| t.name.as_str()).collect();
        assert!(names.contains(&"orders"));
        // products is pulled in through orders.product_id even though the
        // question never names it.
        assert!(names.contains(&"products"));
    }
}
