//! Time window `[from, to)` queried in a single run.

use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use super::job::Job;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { from, to }
    }

    /// Compute the next window for a job.
    ///
    /// `from` is the job's watermark, or `now - default_lookback` when there is
    /// no watermark or the watermark lies in the future (clock skew between
    /// replicas). `to` is capped at `from + max_query_period`. `now` is
    /// truncated to whole seconds so consecutive windows stay contiguous after
    /// literal rendering.
    pub fn compute(job: &Job, now: DateTime<Utc>, default_lookback: Duration) -> Self {
        let now = now.trunc_subsecs(0);
        let from = match job.last_watermark {
            Some(watermark) if watermark <= now => watermark,
            _ => now.checked_sub_signed(default_lookback).unwrap_or(now),
        };
        let to = from
            .checked_add_signed(job.max_query_period())
            .map_or(now, |cap| cap.min(now));
        Self { from, to }
    }

    /// Nothing to query: the window has no extent.
    pub fn is_empty(&self) -> bool {
        self.from >= self.to
    }

    /// Move both bounds by a whole number of hours.
    pub fn shift_hours(&self, hours: i32) -> Self {
        let delta = Duration::hours(i64::from(hours));
        Self {
            from: self.from + delta,
            to: self.to + delta,
        }
    }

    /// Half-open membership test.
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.from && ts < self.to
    }
}

impl std::fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.from.to_rfc3339(), self.to.to_rfc3339())
    }
}
