//! Postgres-backed external sources.
//!
//! Resolves `source_ref` through a static map of connection URLs (credentials
//! are supplied from outside, usually the `LOADER_SOURCES` env var). One pool
//! per source is built on first use and reused afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Row, TypeInfo, ValueRef};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{LoaderError, Result};
use crate::traits::{SourceConnection, SourceResolver};
use crate::types::{ColumnValue, SourceRow};

const SOURCE_POOL_SIZE: u32 = 2;

pub struct PgSourceRegistry {
    urls: HashMap<String, String>,
    pools: RwLock<HashMap<String, PgPool>>,
}

impl PgSourceRegistry {
    pub fn new(urls: HashMap<String, String>) -> Self {
        Self {
            urls,
            pools: RwLock::new(HashMap::new()),
        }
    }

    pub fn source_refs(&self) -> impl Iterator<Item = &str> {
        self.urls.keys().map(String::as_str)
    }

    async fn pool_for(&self, source_ref: &str) -> Result<PgPool> {
        if let Some(pool) = self.pools.read().await.get(source_ref) {
            return Ok(pool.clone());
        }

        let url = self
            .urls
            .get(source_ref)
            .ok_or_else(|| LoaderError::SourceConnection {
                source_ref: source_ref.to_string(),
                source: "no connection configured for this source".into(),
            })?;

        let mut pools = self.pools.write().await;
        // Another task may have connected while we waited for the write lock
        if let Some(pool) = pools.get(source_ref) {
            return Ok(pool.clone());
        }

        let pool = PgPoolOptions::new()
            .max_connections(SOURCE_POOL_SIZE)
            .connect(url)
            .await
            .map_err(|e| LoaderError::SourceConnection {
                source_ref: source_ref.to_string(),
                source: Box::new(e),
            })?;
        info!(source_ref, "connected to source");

        pools.insert(source_ref.to_string(), pool.clone());
        Ok(pool)
    }
}

#[async_trait]
impl SourceResolver for PgSourceRegistry {
    async fn connect(&self, source_ref: &str) -> Result<Arc<dyn SourceConnection>> {
        let pool = self.pool_for(source_ref).await?;
        Ok(Arc::new(PgSourceConnection { pool }))
    }
}

/// A pooled connection to one source database.
pub struct PgSourceConnection {
    pool: PgPool,
}

#[async_trait]
impl SourceConnection for PgSourceConnection {
    async fn query(&self, sql: &str) -> Result<Vec<SourceRow>> {
        let rows = sqlx::query(sql)
            .persistent(false)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| LoaderError::SourceQuery(Box::new(e)))?;
        debug!(rows = rows.len(), "source query returned");

        rows.iter().map(decode_row).collect()
    }
}

fn decode_row(row: &PgRow) -> Result<SourceRow> {
    let mut out = SourceRow::with_capacity(row.columns().len());
    for column in row.columns() {
        let value = decode_column(row, column.ordinal(), column.type_info().name())
            .map_err(|e| LoaderError::SourceQuery(Box::new(e)))?;
        out.insert(column.name().to_string(), value);
    }
    Ok(out)
}

/// Decode by Postgres type name. Unknown types fall back to text, then null.
fn decode_column(row: &PgRow, index: usize, type_name: &str) -> sqlx::Result<ColumnValue> {
    if row.try_get_raw(index)?.is_null() {
        return Ok(ColumnValue::Null);
    }

    let value = match type_name {
        "BOOL" => ColumnValue::Bool(row.try_get(index)?),
        "INT2" => ColumnValue::Int(i64::from(row.try_get::<i16, _>(index)?)),
        "INT4" => ColumnValue::Int(i64::from(row.try_get::<i32, _>(index)?)),
        "INT8" => ColumnValue::Int(row.try_get(index)?),
        "FLOAT4" => ColumnValue::Float(f64::from(row.try_get::<f32, _>(index)?)),
        "FLOAT8" => ColumnValue::Float(row.try_get(index)?),
        "NUMERIC" => decimal_value(row.try_get::<Decimal, _>(index)?),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "CHAR" => ColumnValue::Text(row.try_get(index)?),
        "TIMESTAMP" => ColumnValue::Timestamp(row.try_get::<NaiveDateTime, _>(index)?),
        "TIMESTAMPTZ" => ColumnValue::TimestampTz(row.try_get::<DateTime<Utc>, _>(index)?),
        "DATE" => ColumnValue::Date(row.try_get::<NaiveDate, _>(index)?),
        "UUID" => ColumnValue::Text(row.try_get::<uuid::Uuid, _>(index)?.to_string()),
        "JSON" | "JSONB" => ColumnValue::Text(row.try_get::<serde_json::Value, _>(index)?.to_string()),
        _ => row
            .try_get::<String, _>(index)
            .map(ColumnValue::Text)
            .unwrap_or(ColumnValue::Null),
    };
    Ok(value)
}

fn decimal_value(decimal: Decimal) -> ColumnValue {
    if decimal.fract().is_zero() {
        if let Some(n) = decimal.to_i64() {
            return ColumnValue::Int(n);
        }
    }
    decimal
        .to_f64()
        .map(ColumnValue::Float)
        .unwrap_or(ColumnValue::Null)
}
