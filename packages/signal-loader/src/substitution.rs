//! Query parameter substitution.
//!
//! Replaces the two reserved placeholders `:fromTime` and `:toTime` in a job's
//! query text with literal values for a time window. The literal format is
//! either given explicitly or detected from hints in the SQL text:
//!
//! - epoch/unix-time functions imply a numeric literal (seconds, or
//!   milliseconds when the hint mentions millis)
//! - timestamp cast functions imply an ISO-8601 literal
//! - anything else defaults to ISO-8601
//!
//! When several hints appear, the one nearest a placeholder decides.
//!
//! Only the placeholder spans are touched; everything else (including
//! non-ASCII comments and identifiers) is copied through unchanged.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{LoaderError, Result};
use crate::types::TimeWindow;

pub const FROM_PLACEHOLDER: &str = ":fromTime";
pub const TO_PLACEHOLDER: &str = ":toTime";

const MILLIS_HINTS: &[&str] = &[
    "epoch_ms",
    "epoch_millis",
    "unix_millis",
    "unix_ms",
    "epoch_milli",
    "millis",
];

const SECONDS_HINTS: &[&str] = &[
    "unix_timestamp",
    "from_unixtime",
    "unixepoch",
    "epoch",
    "unix_seconds",
];

const ISO_HINTS: &[&str] = &[
    "to_timestamp",
    "to_date",
    "timestamp '",
    "::timestamp",
    "cast(",
    "convert(",
    "parse_datetime",
    "parse_timestamp",
    "str_to_date",
    "iso8601",
];

/// How window bounds are rendered into the SQL text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiteralFormat {
    /// Quoted `'YYYY-MM-DDTHH:MM:SS'`
    Iso8601,
    /// Integer seconds since the Unix epoch
    EpochSeconds,
    /// Integer milliseconds since the Unix epoch
    EpochMillis,
}

impl LiteralFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            LiteralFormat::Iso8601 => "iso8601",
            LiteralFormat::EpochSeconds => "epoch_seconds",
            LiteralFormat::EpochMillis => "epoch_millis",
        }
    }

    /// Render one bound. `quoted` is true when the template already wraps
    /// the placeholder in single quotes.
    fn render(&self, ts: DateTime<Utc>, quoted: bool) -> String {
        match self {
            LiteralFormat::Iso8601 => {
                let iso = ts.format("%Y-%m-%dT%H:%M:%S").to_string();
                if quoted {
                    iso
                } else {
                    format!("'{iso}'")
                }
            }
            LiteralFormat::EpochSeconds => ts.timestamp().to_string(),
            LiteralFormat::EpochMillis => ts.timestamp_millis().to_string(),
        }
    }
}

impl fmt::Display for LiteralFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LiteralFormat {
    type Err = LoaderError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "iso8601" | "iso-8601" | "iso" => Ok(LiteralFormat::Iso8601),
            "epoch_seconds" | "epoch" | "unix" | "seconds" => Ok(LiteralFormat::EpochSeconds),
            "epoch_millis" | "millis" | "milliseconds" => Ok(LiteralFormat::EpochMillis),
            other => Err(LoaderError::InvalidArgument(format!(
                "unknown placeholder format '{other}'"
            ))),
        }
    }
}

/// Pick a literal format from hints in the SQL text.
///
/// The hint closest to a placeholder wins, so a cast wrapping `:fromTime`
/// beats an epoch function in the select list. Ties go to millis, then
/// seconds, then ISO-8601.
pub fn detect_format(sql: &str) -> LiteralFormat {
    // ASCII lowering keeps byte offsets aligned with `sql`
    let lowered = sql.to_ascii_lowercase();
    let placeholders: Vec<(usize, usize)> = [FROM_PLACEHOLDER, TO_PLACEHOLDER]
        .iter()
        .flat_map(|token| sql.match_indices(token))
        .map(|(start, token)| (start, start + token.len()))
        .collect();

    let distance = |start: usize, end: usize| {
        placeholders
            .iter()
            .map(|&(p_start, p_end)| {
                if end <= p_start {
                    p_start - end
                } else if start >= p_end {
                    start - p_end
                } else {
                    0
                }
            })
            .min()
            .unwrap_or(0)
    };

    let candidates = [
        (MILLIS_HINTS, LiteralFormat::EpochMillis),
        (SECONDS_HINTS, LiteralFormat::EpochSeconds),
        (ISO_HINTS, LiteralFormat::Iso8601),
    ];
    let mut best: Option<(usize, LiteralFormat)> = None;
    for (hints, format) in candidates {
        for hint in hints {
            for (start, _) in lowered.match_indices(hint) {
                let d = distance(start, start + hint.len());
                if best.map_or(true, |(closest, _)| d < closest) {
                    best = Some((d, format));
                }
            }
        }
    }

    best.map_or(LiteralFormat::Iso8601, |(_, format)| format)
}

/// Output of a substitution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Substitution {
    pub sql: String,
    pub format: LiteralFormat,
    pub replacements: usize,
}

/// Substitute every `:fromTime` / `:toTime` occurrence with the window bounds.
pub fn substitute(
    sql: &str,
    window: &TimeWindow,
    format: Option<LiteralFormat>,
) -> Result<Substitution> {
    if sql.trim().is_empty() {
        return Err(LoaderError::InvalidArgument("SQL text is empty".into()));
    }
    if window.from > window.to {
        return Err(LoaderError::InvalidArgument(format!(
            "window start is after window end: {window}"
        )));
    }

    let format = format.unwrap_or_else(|| detect_format(sql));
    let mut out = String::with_capacity(sql.len() + 32);
    let mut replacements = 0;
    let mut rest = 0;

    while let Some((start, token, bound)) = next_placeholder(sql, rest, window) {
        let end = start + token.len();
        let quoted = sql[..start].ends_with('\'') && sql[end..].starts_with('\'');

        out.push_str(&sql[rest..start]);
        out.push_str(&format.render(bound, quoted));
        replacements += 1;
        rest = end;
    }
    out.push_str(&sql[rest..]);

    if replacements == 0 {
        warn!("query text contains no {FROM_PLACEHOLDER}/{TO_PLACEHOLDER} placeholders, running unwindowed");
    }

    Ok(Substitution {
        sql: out,
        format,
        replacements,
    })
}

/// Find the earliest placeholder at or after `offset`.
///
/// A match must end at an identifier boundary so `:fromTimestamp` is left alone.
fn next_placeholder(
    sql: &str,
    offset: usize,
    window: &TimeWindow,
) -> Option<(usize, &'static str, DateTime<Utc>)> {
    let find = |token: &'static str| -> Option<usize> {
        let mut search_from = offset;
        while let Some(pos) = sql[search_from..].find(token) {
            let start = search_from + pos;
            let end = start + token.len();
            let boundary = sql[end..]
                .chars()
                .next()
                .map_or(true, |c| !(c.is_alphanumeric() || c == '_'));
            if boundary {
                return Some(start);
            }
            search_from = end;
        }
        None
    };

    let from = find(FROM_PLACEHOLDER).map(|pos| (pos, FROM_PLACEHOLDER, window.from));
    let to = find(TO_PLACEHOLDER).map(|pos| (pos, TO_PLACEHOLDER, window.to));

    match (from, to) {
        (Some(f), Some(t)) => Some(if f.0 < t.0 { f } else { t }),
        (f, t) => f.or(t),
    }
}
