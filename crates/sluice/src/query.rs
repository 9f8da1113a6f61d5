// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Query execution and the JSON result model.
//!
//! Results cross the worker boundary as plain values, so rows are decoded
//! into JSON objects column-by-column using the Postgres type name. Types
//! without a JSON mapping decode to null rather than failing the whole row.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{Column, Executor, Postgres, Row, TypeInfo, ValueRef};
use tracing::debug;

use crate::error::{Result, SluiceError};

pub use sluice_protocol::envelope::QuerySpec;

/// Result of one statement: decoded rows plus the row count.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryResult {
    pub rows: Vec<Map<String, Value>>,
    pub row_count: u64,
}

impl QueryResult {
    /// First value of the named column in the first row, if any.
    pub fn first(&self, column: &str) -> Option<&Value> {
        self.rows.first().and_then(|row| row.get(column))
    }
}

/// Execute a spec against any Postgres executor (pool, connection, or
/// transaction) and decode the result.
pub async fn run_query<'e, E>(executor: E, spec: &QuerySpec) -> Result<QueryResult>
where
    E: Executor<'e, Database = Postgres>,
{
    let mut query = sqlx::query(&spec.sql);
    for param in &spec.params {
        query = bind_param(query, param);
    }

    let rows = query.fetch_all(executor).await.map_err(SluiceError::wrap)?;
    let mut decoded = Vec::with_capacity(rows.len());
    for row in &rows {
        decoded.push(row_to_json(row)?);
    }

    Ok(QueryResult {
        row_count: decoded.len() as u64,
        rows: decoded,
    })
}

/// Bind one JSON parameter by its JSON type. Arrays and objects bind as
/// JSONB.
fn bind_param<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &Value,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        Value::Null => query.bind(Option::<String>::None),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else {
                query.bind(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => query.bind(s.clone()),
        other => query.bind(other.clone()),
    }
}

/// Decode one row into a JSON object keyed by column name.
pub fn row_to_json(row: &PgRow) -> Result<Map<String, Value>> {
    let mut out = Map::new();
    for (index, column) in row.columns().iter().enumerate() {
        let value = column_to_json(row, index, column.type_info().name())?;
        out.insert(column.name().to_string(), value);
    }
    Ok(out)
}

fn column_to_json(row: &PgRow, index: usize, type_name: &str) -> Result<Value> {
    let raw = row.try_get_raw(index).map_err(SluiceError::wrap)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }

    let value = match type_name {
        "BOOL" => json!(row.try_get::<bool, _>(index).map_err(SluiceError::wrap)?),
        "INT2" => json!(row.try_get::<i16, _>(index).map_err(SluiceError::wrap)?),
        "INT4" => json!(row.try_get::<i32, _>(index).map_err(SluiceError::wrap)?),
        "INT8" => json!(row.try_get::<i64, _>(index).map_err(SluiceError::wrap)?),
        "FLOAT4" => json!(row.try_get::<f32, _>(index).map_err(SluiceError::wrap)?),
        "FLOAT8" => json!(row.try_get::<f64, _>(index).map_err(SluiceError::wrap)?),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "CITEXT" => {
            json!(row.try_get::<String, _>(index).map_err(SluiceError::wrap)?)
        }
        "JSON" | "JSONB" => row
            .try_get::<Value, _>(index)
            .map_err(SluiceError::wrap)?,
        "UUID" => json!(row
            .try_get::<uuid::Uuid, _>(index)
            .map_err(SluiceError::wrap)?
            .to_string()),
        "TIMESTAMPTZ" => json!(row
            .try_get::<chrono::DateTime<chrono::Utc>, _>(index)
            .map_err(SluiceError::wrap)?
            .to_rfc3339()),
        "TIMESTAMP" => json!(row
            .try_get::<chrono::NaiveDateTime, _>(index)
            .map_err(SluiceError::wrap)?
            .to_string()),
        "DATE" => json!(row
            .try_get::<chrono::NaiveDate, _>(index)
            .map_err(SluiceError::wrap)?
            .to_string()),
        other => {
            debug!(column_type = other, "No JSON mapping for column type");
            Value::Null
        }
    };
    Ok(value)
}
