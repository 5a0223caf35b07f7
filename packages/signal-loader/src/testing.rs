//! Testing utilities including mock implementations.
//!
//! These are useful for exercising the scheduler and executor without a real
//! source database or downstream sink.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::error::{LoaderError, Result};
use crate::traits::{SignalSink, SourceConnection, SourceResolver};
use crate::types::{
    ColumnValue, JobDefinition, PurgeStrategy, SignalKey, SignalRecord, SourceRow, TimeWindow,
};

/// Default query used by fixture jobs.
pub const FIXTURE_QUERY: &str =
    "SELECT ts, segment, count FROM events WHERE ts >= :fromTime AND ts < :toTime";

/// Default source reference used by fixture jobs.
pub const FIXTURE_SOURCE: &str = "warehouse";

#[derive(Default)]
struct MockBehavior {
    rows: Vec<SourceRow>,
    error: Option<String>,
    panic: Option<String>,
    delay: Option<Duration>,
}

/// A scripted source connection.
///
/// Returns the configured rows for every query and records the SQL it was
/// given, so tests can assert on substitution.
#[derive(Default)]
pub struct MockSource {
    behavior: RwLock<MockBehavior>,
    queries: RwLock<Vec<String>>,
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return these rows from every subsequent query.
    pub fn respond_with(&self, rows: Vec<SourceRow>) {
        let mut behavior = self.behavior.write().unwrap();
        behavior.rows = rows;
        behavior.error = None;
    }

    /// Fail every subsequent query with a source-query error.
    pub fn fail_with(&self, message: impl Into<String>) {
        self.behavior.write().unwrap().error = Some(message.into());
    }

    /// Panic inside every subsequent query.
    pub fn panic_with(&self, message: impl Into<String>) {
        self.behavior.write().unwrap().panic = Some(message.into());
    }

    /// Sleep before answering.
    pub fn delay(&self, delay: Duration) {
        self.behavior.write().unwrap().delay = Some(delay);
    }

    /// SQL received so far, in order.
    pub fn queries(&self) -> Vec<String> {
        self.queries.read().unwrap().clone()
    }
}

#[async_trait]
impl SourceConnection for MockSource {
    async fn query(&self, sql: &str) -> Result<Vec<SourceRow>> {
        self.queries.write().unwrap().push(sql.to_string());

        let (rows, error, panic, delay) = {
            let behavior = self.behavior.read().unwrap();
            (
                behavior.rows.clone(),
                behavior.error.clone(),
                behavior.panic.clone(),
                behavior.delay,
            )
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = panic {
            panic!("{message}");
        }
        match error {
            Some(message) => Err(LoaderError::source_query(message)),
            None => Ok(rows),
        }
    }
}

/// Resolves source refs to `MockSource`s, creating them on first use.
#[derive(Default)]
pub struct MockSourceResolver {
    sources: RwLock<HashMap<String, Arc<MockSource>>>,
    refused: RwLock<HashSet<String>>,
}

impl MockSourceResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get (or create) the mock behind a source ref.
    pub fn source(&self, source_ref: &str) -> Arc<MockSource> {
        self.sources
            .write()
            .unwrap()
            .entry(source_ref.to_string())
            .or_default()
            .clone()
    }

    /// Make `connect` fail for this source ref.
    pub fn refuse(&self, source_ref: &str) {
        self.refused.write().unwrap().insert(source_ref.to_string());
    }
}

#[async_trait]
impl SourceResolver for MockSourceResolver {
    async fn connect(&self, source_ref: &str) -> Result<Arc<dyn SourceConnection>> {
        if self.refused.read().unwrap().contains(source_ref) {
            return Err(LoaderError::SourceConnection {
                source_ref: source_ref.to_string(),
                source: "connection refused".into(),
            });
        }
        Ok(self.source(source_ref))
    }
}

/// A sink whose writes always fail. Reads report an empty store.
pub struct FailingSink {
    message: String,
}

impl FailingSink {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl SignalSink for FailingSink {
    async fn append(&self, _records: &[SignalRecord]) -> Result<u64> {
        Err(LoaderError::sink(self.message.clone()))
    }

    async fn count_in_window(&self, _job_code: &str, _window: &TimeWindow) -> Result<u64> {
        Ok(0)
    }

    async fn purge_window(&self, _job_code: &str, _window: &TimeWindow) -> Result<u64> {
        Err(LoaderError::sink(self.message.clone()))
    }

    async fn existing_keys(&self, _job_code: &str, _window: &TimeWindow) -> Result<HashSet<SignalKey>> {
        Ok(HashSet::new())
    }
}

/// A valid job definition reading from [`FIXTURE_SOURCE`].
pub fn job_definition(code: &str) -> JobDefinition {
    JobDefinition::builder()
        .code(code)
        .query_text(FIXTURE_QUERY)
        .source_ref(FIXTURE_SOURCE)
        .build()
}

/// Chainable tweaks for fixture definitions.
pub trait JobDefinitionExt {
    fn initial(self, watermark: DateTime<Utc>) -> Self;
    fn strategy(self, strategy: PurgeStrategy) -> Self;
    fn tz_offset(self, hours: i32) -> Self;
    fn parallel(self, max: i32) -> Self;
    fn min_interval(self, seconds: i64) -> Self;
    fn source(self, source_ref: &str) -> Self;
}

impl JobDefinitionExt for JobDefinition {
    fn initial(mut self, watermark: DateTime<Utc>) -> Self {
        self.initial_watermark = Some(watermark);
        self
    }

    fn strategy(mut self, strategy: PurgeStrategy) -> Self {
        self.purge_strategy = strategy;
        self
    }

    fn tz_offset(mut self, hours: i32) -> Self {
        self.source_tz_offset_hours = hours;
        self
    }

    fn parallel(mut self, max: i32) -> Self {
        self.max_parallel_executions = max;
        self
    }

    fn min_interval(mut self, seconds: i64) -> Self {
        self.min_interval_seconds = seconds;
        self.max_interval_seconds = self.max_interval_seconds.max(seconds);
        self
    }

    fn source(mut self, source_ref: &str) -> Self {
        self.source_ref = source_ref.to_string();
        self
    }
}

/// A source row in the canonical column layout.
pub fn signal_row(ts: DateTime<Utc>, segment: &str, count: i64) -> SourceRow {
    let mut row = SourceRow::new();
    row.insert("ts".into(), ColumnValue::TimestampTz(ts));
    row.insert("segment".into(), ColumnValue::Text(segment.to_string()));
    row.insert("count".into(), ColumnValue::Int(count));
    row
}
