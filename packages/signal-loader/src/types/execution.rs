//! Execution history: one append-only record per run attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::window::TimeWindow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "loader_execution_outcome", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionOutcome {
    #[default]
    Running,
    Success,
    Failed,
}

impl ExecutionOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionOutcome::Running)
    }
}

/// Why a successful run ingested nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "loader_empty_reason", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EmptyReason {
    /// The source returned zero rows for the window
    NoRows,
    /// Every returned row was already stored (SKIP_DUPLICATES)
    AllDuplicates,
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub job_code: String,
    pub outcome: ExecutionOutcome,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub requested_from: DateTime<Utc>,
    pub requested_to: DateTime<Utc>,
    pub actual_from: Option<DateTime<Utc>>,
    pub actual_to: Option<DateTime<Utc>>,
    pub rows_ingested: i64,
    pub empty_reason: Option<EmptyReason>,
    pub error_message: Option<String>,
    pub metadata: serde_json::Value,
}

/// Fields written when a run starts.
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub job_code: String,
    pub requested: TimeWindow,
    pub metadata: serde_json::Value,
}

impl NewExecution {
    pub fn into_record(self, start_time: DateTime<Utc>) -> ExecutionRecord {
        ExecutionRecord {
            id: Uuid::now_v7(),
            job_code: self.job_code,
            outcome: ExecutionOutcome::Running,
            start_time,
            end_time: None,
            requested_from: self.requested.from,
            requested_to: self.requested.to,
            actual_from: None,
            actual_to: None,
            rows_ingested: 0,
            empty_reason: None,
            error_message: None,
            metadata: self.metadata,
        }
    }
}

/// Terminal fields written exactly once, on the RUNNING -> terminal transition.
#[derive(Debug, Clone)]
pub struct ExecutionFinish {
    pub outcome: ExecutionOutcome,
    pub end_time: DateTime<Utc>,
    pub actual: Option<TimeWindow>,
    pub rows_ingested: i64,
    pub empty_reason: Option<EmptyReason>,
    pub error_message: Option<String>,
    /// Merged into the metadata written at start
    pub metadata: serde_json::Value,
}

impl ExecutionFinish {
    pub fn success(
        actual: TimeWindow,
        rows_ingested: i64,
        empty_reason: Option<EmptyReason>,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            outcome: ExecutionOutcome::Success,
            end_time: Utc::now(),
            actual: Some(actual),
            rows_ingested,
            empty_reason,
            error_message: None,
            metadata,
        }
    }

    pub fn failure(error_message: impl Into<String>, metadata: serde_json::Value) -> Self {
        Self {
            outcome: ExecutionOutcome::Failed,
            end_time: Utc::now(),
            actual: None,
            rows_ingested: 0,
            empty_reason: None,
            error_message: Some(error_message.into()),
            metadata,
        }
    }
}

/// Shallow-merge two JSON objects; keys in `patch` win.
pub fn merge_metadata(base: &mut serde_json::Value, patch: serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base), serde_json::Value::Object(patch)) => {
            for (key, value) in patch {
                base.insert(key, value);
            }
        }
        (base, patch) if !patch.is_null() => *base = patch,
        _ => {}
    }
}
