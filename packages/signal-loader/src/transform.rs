//! Result transformer: heterogeneous source rows to canonical signal records.
//!
//! Column names are matched case-insensitively against a list of accepted
//! variants per field. The timestamp column is required; every other field is
//! optional and becomes `None` when absent or null. Unrecognized columns are
//! ignored.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};

use crate::error::{LoaderError, Result};
use crate::types::{ColumnValue, SignalRecord, SourceRow};

const TIMESTAMP_COLUMNS: &[&str] = &[
    "timestamp",
    "ts",
    "time",
    "event_time",
    "datetime",
    "date_time",
    "period_start",
    "time_bucket",
    "bucket",
];
const SEGMENT_COLUMNS: &[&str] = &[
    "segment",
    "segment_key",
    "group",
    "group_key",
    "grouping_key",
    "dimension",
    "key",
    "category",
];
const COUNT_COLUMNS: &[&str] = &["count", "cnt", "total", "signal_count", "value_count", "n"];
const MIN_COLUMNS: &[&str] = &["min", "min_value", "minimum"];
const MAX_COLUMNS: &[&str] = &["max", "max_value", "maximum"];
const AVG_COLUMNS: &[&str] = &["avg", "average", "mean", "avg_value"];

/// Integers above this are read as epoch milliseconds rather than seconds.
const EPOCH_MILLIS_CUTOFF: i64 = 100_000_000_000;

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
];

/// Maps source rows for one job into signal records.
#[derive(Debug, Clone)]
pub struct ResultTransformer {
    job_code: String,
    tz_offset: Duration,
}

impl ResultTransformer {
    /// `tz_offset_hours` is added to every timestamp to normalize it to UTC.
    pub fn new(job_code: impl Into<String>, tz_offset_hours: i32) -> Self {
        Self {
            job_code: job_code.into(),
            tz_offset: Duration::hours(i64::from(tz_offset_hours)),
        }
    }

    /// Transform every row, failing on the first bad one.
    ///
    /// All-or-nothing: a single unparseable row rejects the whole batch.
    pub fn transform(&self, rows: &[SourceRow]) -> Result<Vec<SignalRecord>> {
        rows.iter()
            .enumerate()
            .map(|(index, row)| self.transform_row(index, row))
            .collect()
    }

    pub fn transform_row(&self, index: usize, row: &SourceRow) -> Result<SignalRecord> {
        let fail = |reason: String| LoaderError::Transformation { row: index, reason };

        let (column, value) = find_column(row, TIMESTAMP_COLUMNS).ok_or_else(|| {
            fail(format!(
                "no timestamp column (expected one of: {})",
                TIMESTAMP_COLUMNS.join(", ")
            ))
        })?;
        let timestamp = coerce_timestamp(value).map_err(|reason| fail(format!("{column}: {reason}")))?;

        let segment = find_column(row, SEGMENT_COLUMNS).and_then(|(_, v)| coerce_text(v));
        let count = optional(row, COUNT_COLUMNS, coerce_count).map_err(fail)?;
        let min_value = optional(row, MIN_COLUMNS, coerce_float).map_err(fail)?;
        let max_value = optional(row, MAX_COLUMNS, coerce_float).map_err(fail)?;
        let avg_value = optional(row, AVG_COLUMNS, coerce_float).map_err(fail)?;

        Ok(SignalRecord {
            job_code: self.job_code.clone(),
            timestamp: timestamp + self.tz_offset,
            segment,
            count,
            min_value,
            max_value,
            avg_value,
        })
    }
}

/// First column whose lowercased name matches a variant, in variant order.
fn find_column<'a>(row: &'a SourceRow, variants: &[&str]) -> Option<(&'a str, &'a ColumnValue)> {
    variants.iter().find_map(|variant| {
        row.iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(variant))
            .map(|(name, value)| (name.as_str(), value))
    })
}

fn optional<T>(
    row: &SourceRow,
    variants: &[&str],
    coerce: fn(&ColumnValue) -> std::result::Result<Option<T>, String>,
) -> std::result::Result<Option<T>, String> {
    match find_column(row, variants) {
        Some((column, value)) => coerce(value).map_err(|reason| format!("{column}: {reason}")),
        None => Ok(None),
    }
}

fn coerce_timestamp(value: &ColumnValue) -> std::result::Result<DateTime<Utc>, String> {
    match value {
        ColumnValue::TimestampTz(ts) => Ok(*ts),
        ColumnValue::Timestamp(naive) => Ok(naive.and_utc()),
        ColumnValue::Date(date) => date
            .and_hms_opt(0, 0, 0)
            .map(|naive| naive.and_utc())
            .ok_or_else(|| format!("invalid date {date}")),
        ColumnValue::Int(n) => from_epoch(*n),
        ColumnValue::Float(f) if f.is_finite() => from_epoch(f.trunc() as i64),
        ColumnValue::Text(text) => parse_timestamp_text(text),
        ColumnValue::Null => Err("timestamp is null".into()),
        other => Err(format!("cannot read {} as a timestamp", other.type_name())),
    }
}

fn from_epoch(n: i64) -> std::result::Result<DateTime<Utc>, String> {
    let parsed = if n.abs() > EPOCH_MILLIS_CUTOFF {
        Utc.timestamp_millis_opt(n).single()
    } else {
        Utc.timestamp_opt(n, 0).single()
    };
    parsed.ok_or_else(|| format!("epoch value {n} is out of range"))
}

fn parse_timestamp_text(text: &str) -> std::result::Result<DateTime<Utc>, String> {
    let text = text.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Ok(ts.with_timezone(&Utc));
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        if let Some(naive) = date.and_hms_opt(0, 0, 0) {
            return Ok(naive.and_utc());
        }
    }
    if let Ok(n) = text.parse::<i64>() {
        return from_epoch(n);
    }
    Err(format!("unparseable timestamp '{text}'"))
}

fn coerce_text(value: &ColumnValue) -> Option<String> {
    match value {
        ColumnValue::Null => None,
        ColumnValue::Text(s) => Some(s.clone()),
        ColumnValue::Bool(b) => Some(b.to_string()),
        ColumnValue::Int(n) => Some(n.to_string()),
        ColumnValue::Float(f) => Some(f.to_string()),
        ColumnValue::Timestamp(ts) => Some(ts.format("%Y-%m-%dT%H:%M:%S").to_string()),
        ColumnValue::TimestampTz(ts) => Some(ts.to_rfc3339()),
        ColumnValue::Date(d) => Some(d.to_string()),
    }
}

fn coerce_count(value: &ColumnValue) -> std::result::Result<Option<i64>, String> {
    match value {
        ColumnValue::Null => Ok(None),
        ColumnValue::Int(n) => Ok(Some(*n)),
        ColumnValue::Float(f) if f.is_finite() => Ok(Some(f.round() as i64)),
        ColumnValue::Bool(b) => Ok(Some(i64::from(*b))),
        ColumnValue::Text(s) => {
            let s = s.trim();
            if s.is_empty() {
                return Ok(None);
            }
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f.round() as i64))
                .map(Some)
                .ok_or_else(|| format!("'{s}' is not a number"))
        }
        other => Err(format!("cannot read {} as a count", other.type_name())),
    }
}

fn coerce_float(value: &ColumnValue) -> std::result::Result<Option<f64>, String> {
    match value {
        ColumnValue::Null => Ok(None),
        ColumnValue::Int(n) => Ok(Some(*n as f64)),
        ColumnValue::Float(f) => Ok(Some(*f)),
        ColumnValue::Text(s) => {
            let s = s.trim();
            if s.is_empty() {
                return Ok(None);
            }
            s.parse::<f64>()
                .map(Some)
                .map_err(|_| format!("'{s}' is not a number"))
        }
        other => Err(format!("cannot read {} as a number", other.type_name())),
    }
}
