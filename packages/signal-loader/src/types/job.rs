//! Job model: one row per extraction task, keyed by its business code.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;

use crate::error::{LoaderError, Result};
use crate::substitution::{LiteralFormat, FROM_PLACEHOLDER, TO_PLACEHOLDER};

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "loader_job_status", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    #[default]
    Idle,
    Running,
    Failed,
    /// Display-only. Derived from `enabled = false`, never written by the scheduler.
    Paused,
}

impl JobStatus {
    /// Scheduling precedence within a tick (lower runs first).
    ///
    /// Jobs mid-recovery must not block healthy jobs.
    pub fn schedule_rank(&self) -> u8 {
        match self {
            JobStatus::Idle => 0,
            JobStatus::Running => 1,
            JobStatus::Failed => 2,
            JobStatus::Paused => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "loader_purge_strategy", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PurgeStrategy {
    /// Abort the run if any stored signal already falls inside the window
    #[default]
    FailOnDuplicate,
    /// Delete stored signals inside the window, then insert
    PurgeAndReload,
    /// Insert only signals whose natural key is not already stored
    SkipDuplicates,
}

/// Maximum absolute source timezone offset accepted (UTC-14 .. UTC+14).
pub const MAX_TZ_OFFSET_HOURS: i32 = 14;

/// Upper bound for the interval and query period settings (ten years).
pub const MAX_SPAN_SECONDS: i64 = 10 * 365 * 86_400;

// ============================================================================
// Job Model
// ============================================================================

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    // Identity
    pub code: String,
    pub query_text: String,
    pub source_ref: String,

    // Scheduling
    pub min_interval_seconds: i64,
    pub max_interval_seconds: i64,
    pub max_query_period_seconds: i64,
    pub max_parallel_executions: i32,

    // Runtime state
    pub status: JobStatus,
    pub last_watermark: Option<DateTime<Utc>>,
    pub failed_since: Option<DateTime<Utc>>,
    pub consecutive_empty_runs: i32,
    pub source_tz_offset_hours: i32,
    pub purge_strategy: PurgeStrategy,
    pub placeholder_format: Option<String>,
    pub enabled: bool,

    // Timestamps
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Status as seen by operators: a disabled job reads as PAUSED
    /// regardless of its persisted status.
    pub fn effective_status(&self) -> JobStatus {
        if self.enabled {
            self.status
        } else {
            JobStatus::Paused
        }
    }

    /// Cooldown after the last successful window before the next run.
    ///
    /// Clamped to `0..=MAX_SPAN_SECONDS` so an unvalidated row cannot
    /// overflow.
    pub fn min_interval(&self) -> Duration {
        Duration::seconds(self.min_interval_seconds.clamp(0, MAX_SPAN_SECONDS))
    }

    /// Cap on the historical span covered by a single run, clamped to
    /// `1..=MAX_SPAN_SECONDS`.
    pub fn max_query_period(&self) -> Duration {
        Duration::seconds(self.max_query_period_seconds.clamp(1, MAX_SPAN_SECONDS))
    }

    /// Explicit literal format for placeholder substitution, if configured.
    pub fn literal_format(&self) -> Result<Option<LiteralFormat>> {
        self.placeholder_format
            .as_deref()
            .map(str::parse::<LiteralFormat>)
            .transpose()
    }

    /// Check if the job should run now.
    ///
    /// `active_leases` is the number of non-released leases currently held
    /// for this job. A RUNNING job stays due while lease slots remain, which
    /// covers both `max_parallel_executions > 1` and runs orphaned by a crashed
    /// replica whose lease was reaped.
    pub fn is_due(&self, now: DateTime<Utc>, active_leases: i64) -> bool {
        if !self.enabled {
            return false;
        }

        let status_allows = match self.status {
            JobStatus::Idle | JobStatus::Failed => true,
            JobStatus::Running => active_leases < i64::from(self.max_parallel_executions),
            JobStatus::Paused => false,
        };
        if !status_allows {
            return false;
        }

        match self.last_watermark {
            None => true,
            Some(watermark) => watermark
                .checked_add_signed(self.min_interval())
                .is_some_and(|next| now >= next),
        }
    }

    /// Validate the configuration fields.
    pub fn validate(&self) -> Result<()> {
        validate_fields(
            &self.code,
            &self.query_text,
            &self.source_ref,
            self.min_interval_seconds,
            self.max_interval_seconds,
            self.max_query_period_seconds,
            self.max_parallel_executions,
            self.source_tz_offset_hours,
            self.placeholder_format.as_deref(),
        )
    }
}

/// Admin-facing job configuration used to create or update a job.
///
/// Runtime state (status, watermark, failure counters) is never part of a
/// definition; an update keeps the stored runtime state.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct JobDefinition {
    pub code: String,
    pub query_text: String,
    pub source_ref: String,

    #[builder(default = DEFAULT_MIN_INTERVAL_SECONDS)]
    #[serde(default = "default_min_interval")]
    pub min_interval_seconds: i64,
    #[builder(default = DEFAULT_MAX_INTERVAL_SECONDS)]
    #[serde(default = "default_max_interval")]
    pub max_interval_seconds: i64,
    #[builder(default = DEFAULT_MAX_QUERY_PERIOD_SECONDS)]
    #[serde(default = "default_max_query_period")]
    pub max_query_period_seconds: i64,
    #[builder(default = 1)]
    #[serde(default = "default_max_parallel")]
    pub max_parallel_executions: i32,

    #[builder(default = 0)]
    #[serde(default)]
    pub source_tz_offset_hours: i32,
    #[builder(default)]
    #[serde(default)]
    pub purge_strategy: PurgeStrategy,
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub placeholder_format: Option<String>,
    #[builder(default = true)]
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Initial watermark for a newly created job. Ignored on update.
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub initial_watermark: Option<DateTime<Utc>>,
}

const DEFAULT_MIN_INTERVAL_SECONDS: i64 = 300;
const DEFAULT_MAX_INTERVAL_SECONDS: i64 = 3600;
const DEFAULT_MAX_QUERY_PERIOD_SECONDS: i64 = 86_400;

fn default_min_interval() -> i64 {
    DEFAULT_MIN_INTERVAL_SECONDS
}

fn default_max_interval() -> i64 {
    DEFAULT_MAX_INTERVAL_SECONDS
}

fn default_max_query_period() -> i64 {
    DEFAULT_MAX_QUERY_PERIOD_SECONDS
}

fn default_max_parallel() -> i32 {
    1
}

fn default_enabled() -> bool {
    true
}

impl JobDefinition {
    pub fn validate(&self) -> Result<()> {
        validate_fields(
            &self.code,
            &self.query_text,
            &self.source_ref,
            self.min_interval_seconds,
            self.max_interval_seconds,
            self.max_query_period_seconds,
            self.max_parallel_executions,
            self.source_tz_offset_hours,
            self.placeholder_format.as_deref(),
        )
    }

    /// Materialize a fresh job row in IDLE state.
    pub fn into_job(self, now: DateTime<Utc>) -> Job {
        Job {
            code: self.code,
            query_text: self.query_text,
            source_ref: self.source_ref,
            min_interval_seconds: self.min_interval_seconds,
            max_interval_seconds: self.max_interval_seconds,
            max_query_period_seconds: self.max_query_period_seconds,
            max_parallel_executions: self.max_parallel_executions,
            status: JobStatus::Idle,
            last_watermark: self.initial_watermark,
            failed_since: None,
            consecutive_empty_runs: 0,
            source_tz_offset_hours: self.source_tz_offset_hours,
            purge_strategy: self.purge_strategy,
            placeholder_format: self.placeholder_format,
            enabled: self.enabled,
            created_at: now,
            updated_at: now,
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn validate_fields(
    code: &str,
    query_text: &str,
    source_ref: &str,
    min_interval_seconds: i64,
    max_interval_seconds: i64,
    max_query_period_seconds: i64,
    max_parallel_executions: i32,
    source_tz_offset_hours: i32,
    placeholder_format: Option<&str>,
) -> Result<()> {
    let invalid = |reason: String| Err(LoaderError::Validation(format!("{code}: {reason}")));

    if code.trim().is_empty() {
        return Err(LoaderError::Validation("job code must not be empty".into()));
    }
    if query_text.trim().is_empty() {
        return invalid("query text must not be empty".into());
    }
    if source_ref.trim().is_empty() {
        return invalid("source reference must not be empty".into());
    }
    if min_interval_seconds < 0 {
        return invalid(format!("min interval must be >= 0, got {min_interval_seconds}"));
    }
    if min_interval_seconds > MAX_SPAN_SECONDS || max_interval_seconds > MAX_SPAN_SECONDS {
        return invalid(format!(
            "intervals must be <= {MAX_SPAN_SECONDS}s, got min {min_interval_seconds}s / max {max_interval_seconds}s"
        ));
    }
    if max_interval_seconds < min_interval_seconds {
        return invalid(format!(
            "max interval ({max_interval_seconds}s) is shorter than min interval ({min_interval_seconds}s)"
        ));
    }
    if max_query_period_seconds <= 0 || max_query_period_seconds > MAX_SPAN_SECONDS {
        return invalid(format!(
            "max query period must be in 1..={MAX_SPAN_SECONDS}s, got {max_query_period_seconds}"
        ));
    }
    if max_parallel_executions < 1 {
        return invalid(format!(
            "max parallel executions must be >= 1, got {max_parallel_executions}"
        ));
    }
    if source_tz_offset_hours.abs() > MAX_TZ_OFFSET_HOURS {
        return invalid(format!(
            "source timezone offset {source_tz_offset_hours}h is outside +/-{MAX_TZ_OFFSET_HOURS}h"
        ));
    }
    if let Some(format) = placeholder_format {
        if let Err(e) = format.parse::<LiteralFormat>() {
            return invalid(e.to_string());
        }
    }

    // A window with only one bound is almost always a typo
    let has_from = query_text.contains(FROM_PLACEHOLDER);
    let has_to = query_text.contains(TO_PLACEHOLDER);
    if has_from != has_to {
        return invalid(format!(
            "query references only one of {FROM_PLACEHOLDER} / {TO_PLACEHOLDER}"
        ));
    }
    for wrong_case in [":fromtime", ":totime", ":FromTime", ":ToTime", ":FROMTIME", ":TOTIME"] {
        if query_text.contains(wrong_case) {
            return invalid(format!(
                "placeholder '{wrong_case}' is case-sensitive, use {FROM_PLACEHOLDER} / {TO_PLACEHOLDER}"
            ));
        }
    }

    Ok(())
}
