//! Downstream signal ingestion.

use std::collections::HashSet;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{SignalKey, SignalRecord, TimeWindow};

/// Append-only store of canonical signal records.
///
/// Window queries are half-open `[from, to)` on the record timestamp.
#[async_trait]
pub trait SignalSink: Send + Sync {
    /// Append a batch. Returns the number of records written.
    async fn append(&self, records: &[SignalRecord]) -> Result<u64>;

    /// Stored records for the job whose timestamp falls in the window.
    async fn count_in_window(&self, job_code: &str, window: &TimeWindow) -> Result<u64>;

    /// Delete stored records for the job inside the window.
    async fn purge_window(&self, job_code: &str, window: &TimeWindow) -> Result<u64>;

    /// Natural keys already stored for the job inside the window.
    async fn existing_keys(&self, job_code: &str, window: &TimeWindow) -> Result<HashSet<SignalKey>>;

    /// Purge the window then append. Callers pass only records inside the
    /// window. Backends with transactions should override this so a failed
    /// append leaves the old records in place.
    async fn replace_window(
        &self,
        job_code: &str,
        window: &TimeWindow,
        records: &[SignalRecord],
    ) -> Result<u64> {
        self.purge_window(job_code, window).await?;
        self.append(records).await
    }
}
