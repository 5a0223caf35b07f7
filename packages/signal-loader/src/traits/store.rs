//! Coordination datastore traits.
//!
//! Split the same way as the page storage seams elsewhere in the workspace:
//! - `JobStore`: job configuration and runtime state
//! - `LeaseStore`: execution leases
//! - `ExecutionLog`: append-only run history
//! - `LoaderStore`: composite of all three

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::types::{ExecutionFinish, ExecutionRecord, Job, JobDefinition, Lease, NewExecution};

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a job or update its configuration fields.
    ///
    /// Runtime state of an existing job is preserved. The definition is
    /// validated before anything is written.
    async fn upsert_job(&self, definition: JobDefinition) -> Result<Job>;

    async fn get_job(&self, code: &str) -> Result<Option<Job>>;

    /// All jobs, enabled or not.
    async fn list_jobs(&self) -> Result<Vec<Job>>;

    async fn list_enabled_jobs(&self) -> Result<Vec<Job>>;

    /// Soft-disable or re-enable a job. Status is left untouched.
    async fn set_enabled(&self, code: &str, enabled: bool) -> Result<()>;

    /// Reset enabled FAILED jobs with `failed_since <= cutoff` to IDLE.
    ///
    /// Returns the codes of the recovered jobs.
    async fn recover_failed_jobs(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>>;

    async fn mark_running(&self, code: &str, now: DateTime<Utc>) -> Result<()>;

    /// Record a successful run: watermark advances (never backwards), the
    /// empty-run counter is bumped or reset, status returns to IDLE.
    ///
    /// Returns the updated job.
    async fn record_success(
        &self,
        code: &str,
        watermark: DateTime<Utc>,
        empty: bool,
        now: DateTime<Utc>,
    ) -> Result<Job>;

    /// Record a failed run: status FAILED, `failed_since = now`, watermark untouched.
    async fn record_failure(&self, code: &str, now: DateTime<Utc>) -> Result<()>;
}

#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Atomically insert a lease if the job has fewer non-released leases
    /// than its `max_parallel_executions`.
    ///
    /// Returns `None` when the ceiling is reached.
    async fn try_acquire_lease(
        &self,
        job_code: &str,
        holder: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Lease>>;

    /// Mark a lease released. Returns false when it was unknown or already released.
    async fn release_lease(&self, lease_id: Uuid, now: DateTime<Utc>) -> Result<bool>;

    /// Link a lease to the execution record it backs.
    async fn attach_execution(&self, lease_id: Uuid, execution_id: Uuid) -> Result<()>;

    /// Release every non-released lease acquired before `cutoff`.
    async fn release_stale_leases(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<u64>;

    /// Non-released leases, optionally for a single job.
    async fn active_leases(&self, job_code: Option<&str>) -> Result<Vec<Lease>>;

    /// Non-released lease count per job code. Jobs without leases are absent.
    async fn active_lease_counts(&self) -> Result<HashMap<String, i64>> {
        let mut counts = HashMap::new();
        for lease in self.active_leases(None).await? {
            *counts.entry(lease.job_code).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

#[async_trait]
pub trait ExecutionLog: Send + Sync {
    /// Append a RUNNING record.
    async fn start_execution(
        &self,
        execution: NewExecution,
        start_time: DateTime<Utc>,
    ) -> Result<ExecutionRecord>;

    /// Apply the RUNNING -> terminal transition.
    ///
    /// Returns false when the record is unknown or already terminal; a
    /// terminal record is never rewritten.
    async fn finish_execution(&self, id: Uuid, finish: ExecutionFinish) -> Result<bool>;

    async fn get_execution(&self, id: Uuid) -> Result<Option<ExecutionRecord>>;

    /// Most recent first.
    async fn recent_executions(&self, job_code: &str, limit: i64) -> Result<Vec<ExecutionRecord>>;
}

/// Composite storage trait used by the scheduler and executor.
pub trait LoaderStore: JobStore + LeaseStore + ExecutionLog {}

// Blanket implementation: anything implementing all three traits is a LoaderStore
impl<T: JobStore + LeaseStore + ExecutionLog> LoaderStore for T {}
