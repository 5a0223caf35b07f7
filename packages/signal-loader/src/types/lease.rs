//! Execution lease: one row per acquired execution slot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(FromRow, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub id: Uuid,
    pub job_code: String,
    /// Replica that acquired the lease
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
    /// Execution record this lease backs, once the run has started
    pub execution_record_id: Option<Uuid>,
}

impl Lease {
    /// Create an unreleased lease stamped with the given acquisition time.
    pub fn new(job_code: impl Into<String>, holder: impl Into<String>, acquired_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            job_code: job_code.into(),
            holder: holder.into(),
            acquired_at,
            released_at: None,
            execution_record_id: None,
        }
    }

    pub fn is_released(&self) -> bool {
        self.released_at.is_some()
    }

    /// A lease is stale once it has been held past the cutoff.
    pub fn is_stale(&self, cutoff: DateTime<Utc>) -> bool {
        !self.is_released() && self.acquired_at < cutoff
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn new_lease_is_active() {
        let lease = Lease::new("orders", "replica-a", Utc::now());
        assert!(!lease.is_released());
        assert!(lease.execution_record_id.is_none());
    }

    #[test]
    fn stale_only_when_unreleased_and_older_than_cutoff() {
        let now = Utc::now();
        let cutoff = now - Duration::hours(2);

        let old = Lease::new("orders", "replica-a", now - Duration::hours(3));
        assert!(old.is_stale(cutoff));

        let fresh = Lease::new("orders", "replica-a", now - Duration::minutes(30));
        assert!(!fresh.is_stale(cutoff));

        let mut released = old.clone();
        released.released_at = Some(now);
        assert!(!released.is_stale(cutoff));
    }
}
