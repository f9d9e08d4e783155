//! Postgres adapter over a single sqlx connection.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::TryStreamExt;
use rust_decimal::prelude::ToPrimitive;
use serde_json::{Value, json};
use sqlx::postgres::{PgConnection, PgRow};
use sqlx::{Column, Connection, Row, TypeInfo};

use crate::core::error::EngineError;
use crate::core::types::{
    ColumnDescriptor, ConnectionInfo, ForeignKeyRef, SchemaDescriptor, TableDescriptor,
};

use super::{Adapter, Dialect, QueryColumn, QueryOptions, QueryOutput, url_from_parts};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct PostgresAdapter {
    conn: PgConnection,
}

impl PostgresAdapter {
    pub async fn connect(info: &ConnectionInfo) -> Result<Self, EngineError> {
        let url = url_from_parts("postgres", info, 5432);
        let conn = tokio::time::timeout(CONNECT_TIMEOUT, PgConnection::connect(&url))
            .await
            .map_err(|_| EngineError::DbTransient("postgres connect timed out".to_string()))??;
        Ok(Self { conn })
    }
}

#[async_trait]
impl Adapter for PostgresAdapter {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
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
        let column_rows = sqlx::query(
            "SELECT c.table_name, c.column_name, c.data_type, c.is_nullable \
             FROM information_schema.columns c \
             JOIN information_schema.tables t \
               ON t.table_name = c.table_name AND t.table_schema = c.table_schema \
             WHERE c.table_schema = 'public' AND t.table_type = 'BASE TABLE' \
             ORDER BY c.table_name, c.ordinal_position",
        )
        .fetch_all(&mut self.conn)
        .await?;

        let pk_rows = sqlx::query(
            "SELECT tc.table_name, kcu.column_name \
             FROM information_schema.table_constraints tc \
             JOIN information_schema.key_column_usage kcu \
               ON tc.constraint_name = kcu.constraint_name AND tc.table_schema = kcu.table_schema \
             WHERE tc.constraint_type = 'PRIMARY KEY' AND tc.table_schema = 'public'",
        )
        .fetch_all(&mut self.conn)
        .await?;

        let fk_rows = sqlx::query(
            "SELECT tc.table_name, kcu.column_name, \
                    ccu.table_name AS foreign_table, ccu.column_name AS foreign_column \
             FROM information_schema.table_constraints tc \
             JOIN information_schema.key_column_usage kcu \
               ON tc.constraint_name = kcu.constraint_name AND tc.table_schema = kcu.table_schema \
             JOIN information_schema.constraint_column_usage ccu \
               ON tc.constraint_name = ccu.constraint_name AND tc.table_schema = ccu.table_schema \
             WHERE tc.constraint_type = 'FOREIGN KEY' AND tc.table_schema = 'public'",
        )
        .fetch_all(&mut self.conn)
        .await?;

        let mut primary: HashMap<(String, String), bool> = HashMap::new();
        for row in &pk_rows {
            let table: String = row.try_get(0)?;
            let column: String = row.try_get(1)?;
            primary.insert((table, column), true);
        }

        let mut foreign: HashMap<(String, String), ForeignKeyRef> = HashMap::new();
        for row in &fk_rows {
            let table: String = row.try_get(0)?;
            let column: String = row.try_get(1)?;
            let f_table: String = row.try_get(2)?;
            let f_column: String = row.try_get(3)?;
            foreign.insert(
                (table, column),
                ForeignKeyRef {
                    table: f_table,
                    column: f_column,
                },
            );
        }

        let mut tables: Vec<TableDescriptor> = Vec::new();
        for row in &column_rows {
            let table: String = row.try_get(0)?;
            let column: String = row.try_get(1)?;
            let data_type: String = row.try_get(2)?;
            let nullable: String = row.try_get(3)?;
            let key = (table.clone(), column.clone());
            let descriptor = ColumnDescriptor {
                name: column,
                data_type,
                nullable: nullable == "YES",
                primary_key: primary.contains_key(&key),
                foreign_key: foreign.get(&key).cloned(),
            };
            match tables.last_mut() {
                Some(t) if t.name == table => t.columns.push(descriptor),
                _ => tables.push(TableDescriptor {
                    name: table,
                    columns: vec![descriptor],
                    row_count: None,
                }),
            }
        }

        Ok(SchemaDescriptor {
            tables,
            dialect: Dialect::Postgres.as_str().to_string(),
        })
    }

    async fn probe(&mut self) -> Result<(), EngineError> {
        sqlx::query("SELECT 1").fetch_one(&mut self.conn).await?;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), EngineError> {
        // sqlx connections close on drop; ping is enough to flush in-flight work.
        self.conn.ping().await.ok();
        Ok(())
    }
}

fn decode_row(row: &PgRow) -> Vec<Value> {
    (0..row.columns().len())
        .map(|idx| {
            let type_name = row.columns()[idx].type_info().name().to_string();
            decode_value(row, idx, &type_name)
        })
        .collect()
}

fn decode_value(row: &PgRow, idx: usize, type_name: &str) -> Value {
    let decoded: Result<Value, sqlx::Error> = match type_name {
        "BOOL" => row.try_get::<Option<bool>, _>(idx).map(|v| json!(v)),
        "INT2" => row.try_get::<Option<i16>, _>(idx).map(|v| json!(v)),
        "INT4" => row.try_get::<Option<i32>, _>(idx).map(|v| json!(v)),
        "INT8" => row.try_get::<Option<i64>, _>(idx).map(|v| json!(v)),
        "FLOAT4" => row.try_get::<Option<f32>, _>(idx).map(|v| json!(v)),
        "FLOAT8" => row.try_get::<Option<f64>, _>(idx).map(|v| json!(v)),
        "NUMERIC" => row
            .try_get::<Option<rust_decimal::Decimal>, _>(idx)
            .map(|v| match v {
                Some(d) => d
                    .to_f64()
                    .map(|f| json!(f))
                    .unwrap_or_else(|| json!(d.to_string())),
                None => Value::Null,
            }),
        "UUID" => row
            .try_get::<Option<uuid::Uuid>, _>(idx)
            .map(|v| json!(v.map(|u| u.to_string()))),
        "DATE" => row
            .try_get::<Option<chrono::NaiveDate>, _>(idx)
            .map(|v| json!(v.map(|d| d.to_string()))),
        "TIME" => row
            .try_get::<Option<chrono::NaiveTime>, _>(idx)
            .map(|v| json!(v.map(|t| t.to_string()))),
        "TIMESTAMP" => row
            .try_get::<Option<chrono::NaiveDateTime>, _>(idx)
            .map(|v| json!(v.map(|t| t.to_string()))),
        "TIMESTAMPTZ" => row
            .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx)
            .map(|v| json!(v.map(|t| t.to_rfc3339()))),
        "JSON" | "JSONB" => row.try_get::<Option<Value>, _>(idx).map(|v| json!(v)),
        _ => row.try_get::<Option<String>, _>(idx).map(|v| json!(v)),
    };

    decoded.unwrap_or_else(|_| {
        row.try_get::<Option<String>, _>(idx)
            .map(|v| json!(v))
            .unwrap_or(Value::Null)
    })
}
