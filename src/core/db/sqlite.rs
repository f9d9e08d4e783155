//! SQLite adapter over a single sqlx connection. Handy both for embedded
//! datasources and as the engine the test suite runs against.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::TryStreamExt;
use serde_json::{Value, json};
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::{Column, Connection, Row, TypeInfo};

use crate::core::error::EngineError;
use crate::core::types::{
    ColumnDescriptor, ConnectionInfo, ForeignKeyRef, SchemaDescriptor, TableDescriptor,
};

use super::{Adapter, Dialect, QueryColumn, QueryOptions, QueryOutput};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct SqliteAdapter {
    conn: SqliteConnection,
}

impl SqliteAdapter {
    pub async fn connect(info: &ConnectionInfo) -> Result<Self, EngineError> {
        let url = match info.options.get("url") {
            Some(url) => url.clone(),
            None => {
                let path = info
                    .path
                    .as_deref()
                    .or(info.database.as_deref())
                    .ok_or_else(|| {
                        EngineError::Validation(
                            "sqlite datasource requires a file path".to_string(),
                        )
                    })?;
                if path == ":memory:" {
                    "sqlite::memory:".to_string()
                } else {
                    format!("sqlite://{path}?mode=rwc")
                }
            }
        };
        let conn = tokio::time::timeout(CONNECT_TIMEOUT, SqliteConnection::connect(&url))
            .await
            .map_err(|_| EngineError::DbTransient("sqlite connect timed out".to_string()))??;
        Ok(Self { conn })
    }
}

#[async_trait]
impl Adapter for SqliteAdapter {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn execute(
        &mut self,
        sql: &str,
        opts: &QueryOptions,
    ) -> Result<QueryOutput, EngineError> {
        let started = Instant::now();
        let max_rows = opts.max_rows;
        let fetch = async {
            let mut columns: Vec<QueryColumn> = Vec::new();
            let mut rows: Vec<Vec<Value>> = Vec::new();
            let mut truncated = false;
            let mut stream = sqlx::query(sql).fetch(&mut self.conn);
            while let Some(row) = stream.try_next().await? {
                if columns.is_empty() {
                    columns = row
                        .columns()
                        .iter()
                        .map(|c| QueryColumn {
                            name: c.name().to_string(),
                            data_type: c.type_info().name().to_string(),
                        })
                        .collect();
                }
                if rows.len() >= max_rows {
                    truncated = true;
                    break;
                }
                rows.push(decode_row(&row));
            }
            Ok::<_, sqlx::Error>((columns, rows, truncated))
        };

        let (columns, rows, truncated) =
            tokio::time::timeout(Duration::from_millis(opts.timeout_ms), fetch)
                .await
                .map_err(|_| {
                    EngineError::Timeout(format!("query exceeded {}ms", opts.timeout_ms))
                })??;

        Ok(QueryOutput {
            row_count: rows.len(),
            columns,
            rows,
            duration_ms: started.elapsed().as_millis() as u64,
            truncated,
        })
    }

    async fn introspect(&mut self) -> Result<SchemaDescriptor, EngineError> {
        let table_rows = sqlx::query(
            "SELECT name FROM sqlite_master \
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&mut self.conn)
        .await?;

        let mut tables = Vec::new();
        for row in &table_rows {
            let table: String = row.try_get(0)?;
            let quoted = table.replace('\'', "''");

            let mut foreign: Vec<(String, ForeignKeyRef)> = Vec::new();
            let fk_rows = sqlx::query(&format!("PRAGMA foreign_key_list('{quoted}')"))
                .fetch_all(&mut self.conn)
                .await?;
            for fk in &fk_rows {
                let target_table: String = fk.try_get("table")?;
                let from: String = fk.try_get("from")?;
                let to: Option<String> = fk.try_get("to")?;
                foreign.push((
                    from,
                    ForeignKeyRef {
                        table: target_table,
                        column: to.unwrap_or_else(|| "id".to_string()),
                    },
                ));
            }

            let mut columns = Vec::new();
            let info_rows = sqlx::query(&format!("PRAGMA table_info('{quoted}')"))
                .fetch_all(&mut self.conn)
                .await?;
            for info in &info_rows {
                let name: String = info.try_get("name")?;
                let data_type: String = info.try_get("type")?;
                let notnull: i64 = info.try_get("notnull")?;
                let pk: i64 = info.try_get("pk")?;
                let foreign_key = foreign
                    .iter()
                    .find(|(from, _)| from == &name)
                    .map(|(_, fk)| fk.clone());
                columns.push(ColumnDescriptor {
                    name,
                    data_type,
                    nullable: notnull == 0,
                    primary_key: pk > 0,
                    foreign_key,
                });
            }

            tables.push(TableDescriptor {
                name: table,
                columns,
                row_count: None,
            });
        }

        Ok(SchemaDescriptor {
            tables,
            dialect: Dialect::Sqlite.as_str().to_string(),
        })
    }

    async fn probe(&mut self) -> Result<(), EngineError> {
        sqlx::query("SELECT 1").fetch_one(&mut self.conn).await?;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), EngineError> {
        self.conn.ping().await.ok();
        Ok(())
    }
}

fn decode_row(row: &SqliteRow) -> Vec<Value> {
    (0..row.columns().len())
        .map(|idx| {
            let type_name = row.columns()[idx].type_info().name().to_string();
            decode_value(row, idx, &type_name)
        })
        .collect()
}

// SQLite typing is dynamic; the declared affinity is a hint, so fall through
// integer -> float -> text on mismatch.
fn decode_value(row: &SqliteRow, idx: usize, type_name: &str) -> Value {
    let decoded: Result<Value, sqlx::Error> = match type_name {
        "BOOLEAN" => row.try_get::<Option<bool>, _>(idx).map(|v| json!(v)),
        "INTEGER" => row.try_get::<Option<i64>, _>(idx).map(|v| json!(v)),
        "REAL" | "NUMERIC" => row.try_get::<Option<f64>, _>(idx).map(|v| json!(v)),
        "TEXT" | "DATE" | "DATETIME" => row.try_get::<Option<String>, _>(idx).map(|v| json!(v)),
        _ => row.try_get::<Option<String>, _>(idx).map(|v| json!(v)),
    };

    decoded
        .or_else(|_| row.try_get::<Option<i64>, _>(idx).map(|v| json!(v)))
        .or_else(|_| row.try_get::<Option<f64>, _>(idx).map(|v| json!(v)))
        .or_else(|_| row.try_get::<Option<String>, _>(idx).map(|v| json!(v)))
        .unwrap_or(Value::Null)
}
