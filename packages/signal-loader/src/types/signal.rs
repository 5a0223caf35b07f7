//! Source rows and the canonical signal record shape.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A single value from a source result set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ColumnValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    /// Timestamp without zone, in the source's local time
    Timestamp(NaiveDateTime),
    /// Timestamp with zone
    TimestampTz(DateTime<Utc>),
    Date(NaiveDate),
}

impl ColumnValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Null)
    }

    /// Short type label used in transformation errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            ColumnValue::Null => "null",
            ColumnValue::Bool(_) => "bool",
            ColumnValue::Int(_) => "int",
            ColumnValue::Float(_) => "float",
            ColumnValue::Text(_) => "text",
            ColumnValue::Timestamp(_) => "timestamp",
            ColumnValue::TimestampTz(_) => "timestamptz",
            ColumnValue::Date(_) => "date",
        }
    }
}

impl From<i64> for ColumnValue {
    fn from(v: i64) -> Self {
        ColumnValue::Int(v)
    }
}

impl From<f64> for ColumnValue {
    fn from(v: f64) -> Self {
        ColumnValue::Float(v)
    }
}

impl From<&str> for ColumnValue {
    fn from(v: &str) -> Self {
        ColumnValue::Text(v.to_string())
    }
}

impl From<String> for ColumnValue {
    fn from(v: String) -> Self {
        ColumnValue::Text(v)
    }
}

impl From<NaiveDateTime> for ColumnValue {
    fn from(v: NaiveDateTime) -> Self {
        ColumnValue::Timestamp(v)
    }
}

impl From<DateTime<Utc>> for ColumnValue {
    fn from(v: DateTime<Utc>) -> Self {
        ColumnValue::TimestampTz(v)
    }
}

impl<T: Into<ColumnValue>> From<Option<T>> for ColumnValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(ColumnValue::Null)
    }
}

/// One result-set row: column name to value, in source column order.
pub type SourceRow = IndexMap<String, ColumnValue>;

/// Canonical signal record appended to the central store.
#[derive(FromRow, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRecord {
    pub job_code: String,
    /// Normalized to UTC
    pub timestamp: DateTime<Utc>,
    pub segment: Option<String>,
    pub count: Option<i64>,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub avg_value: Option<f64>,
}

impl SignalRecord {
    pub fn new(job_code: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            job_code: job_code.into(),
            timestamp,
            segment: None,
            count: None,
            min_value: None,
            max_value: None,
            avg_value: None,
        }
    }

    pub fn with_segment(mut self, segment: impl Into<String>) -> Self {
        self.segment = Some(segment.into());
        self
    }

    pub fn with_count(mut self, count: i64) -> Self {
        self.count = Some(count);
        self
    }

    pub fn key(&self) -> SignalKey {
        SignalKey {
            job_code: self.job_code.clone(),
            timestamp: self.timestamp,
            segment: self.segment.clone(),
        }
    }
}

/// Natural key used by SKIP_DUPLICATES: job code plus window slot
/// (timestamp) plus segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignalKey {
    pub job_code: String,
    pub timestamp: DateTime<Utc>,
    pub segment: Option<String>,
}
