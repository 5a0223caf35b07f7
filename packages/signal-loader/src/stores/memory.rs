//! In-memory storage implementation for testing and development.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

use crate::error::{LoaderError, Result};
use crate::traits::{ExecutionLog, JobStore, LeaseStore, SignalSink};
use crate::types::{
    merge_metadata, ExecutionFinish, ExecutionOutcome, ExecutionRecord, Job, JobDefinition,
    JobStatus, Lease, NewExecution, SignalKey, SignalRecord, TimeWindow,
};

#[derive(Default)]
struct State {
    jobs: HashMap<String, Job>,
    leases: Vec<Lease>,
    executions: Vec<ExecutionRecord>,
}

/// In-memory coordination store.
///
/// All state sits behind one lock, so lease check-and-insert is atomic
/// across tasks in the same process. Not suitable for production as data is
/// lost on restart and nothing is shared between replicas.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert or overwrite a job row as-is, runtime state included.
    pub fn insert_job(&self, job: Job) {
        self.write().jobs.insert(job.code.clone(), job);
    }

    /// Insert a lease row as-is, bypassing the ceiling check.
    pub fn insert_lease(&self, lease: Lease) {
        self.write().leases.push(lease);
    }

    pub fn lease(&self, id: Uuid) -> Option<Lease> {
        self.read().leases.iter().find(|l| l.id == id).cloned()
    }

    /// Every lease ever acquired, released or not.
    pub fn leases(&self) -> Vec<Lease> {
        self.read().leases.clone()
    }

    /// Every execution record, oldest first.
    pub fn executions(&self) -> Vec<ExecutionRecord> {
        self.read().executions.clone()
    }

    fn with_job<T>(&self, code: &str, f: impl FnOnce(&mut Job) -> T) -> Result<T> {
        let mut state = self.write();
        let job = state
            .jobs
            .get_mut(code)
            .ok_or_else(|| LoaderError::JobNotFound(code.to_string()))?;
        Ok(f(job))
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn upsert_job(&self, definition: JobDefinition) -> Result<Job> {
        definition.validate()?;
        let now = Utc::now();
        let mut state = self.write();

        let job = match state.jobs.get(&definition.code) {
            Some(existing) => Job {
                query_text: definition.query_text,
                source_ref: definition.source_ref,
                min_interval_seconds: definition.min_interval_seconds,
                max_interval_seconds: definition.max_interval_seconds,
                max_query_period_seconds: definition.max_query_period_seconds,
                max_parallel_executions: definition.max_parallel_executions,
                source_tz_offset_hours: definition.source_tz_offset_hours,
                purge_strategy: definition.purge_strategy,
                placeholder_format: definition.placeholder_format,
                enabled: definition.enabled,
                updated_at: now,
                ..existing.clone()
            },
            None => definition.into_job(now),
        };

        state.jobs.insert(job.code.clone(), job.clone());
        Ok(job)
    }

    async fn get_job(&self, code: &str) -> Result<Option<Job>> {
        Ok(self.read().jobs.get(code).cloned())
    }

    async fn list_jobs(&self) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self.read().jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(jobs)
    }

    async fn list_enabled_jobs(&self) -> Result<Vec<Job>> {
        let mut jobs = self.list_jobs().await?;
        jobs.retain(|j| j.enabled);
        Ok(jobs)
    }

    async fn set_enabled(&self, code: &str, enabled: bool) -> Result<()> {
        self.with_job(code, |job| {
            job.enabled = enabled;
            job.updated_at = Utc::now();
        })
    }

    async fn recover_failed_jobs(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let now = Utc::now();
        let mut state = self.write();
        let mut recovered = Vec::new();

        for job in state.jobs.values_mut() {
            let expired = job.failed_since.map_or(true, |since| since <= cutoff);
            if job.enabled && job.status == JobStatus::Failed && expired {
                job.status = JobStatus::Idle;
                job.failed_since = None;
                job.updated_at = now;
                recovered.push(job.code.clone());
            }
        }

        recovered.sort();
        Ok(recovered)
    }

    async fn mark_running(&self, code: &str, now: DateTime<Utc>) -> Result<()> {
        self.with_job(code, |job| {
            job.status = JobStatus::Running;
            job.updated_at = now;
        })
    }

    async fn record_success(
        &self,
        code: &str,
        watermark: DateTime<Utc>,
        empty: bool,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        self.with_job(code, |job| {
            job.last_watermark = Some(job.last_watermark.map_or(watermark, |w| w.max(watermark)));
            job.consecutive_empty_runs = if empty {
                job.consecutive_empty_runs.saturating_add(1)
            } else {
                0
            };
            job.status = JobStatus::Idle;
            job.failed_since = None;
            job.updated_at = now;
            job.clone()
        })
    }

    async fn record_failure(&self, code: &str, now: DateTime<Utc>) -> Result<()> {
        self.with_job(code, |job| {
            job.status = JobStatus::Failed;
            job.failed_since = Some(now);
            job.updated_at = now;
        })
    }
}

#[async_trait]
impl LeaseStore for MemoryStore {
    async fn try_acquire_lease(
        &self,
        job_code: &str,
        holder: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Lease>> {
        let mut state = self.write();
        let ceiling = state
            .jobs
            .get(job_code)
            .map(|job| i64::from(job.max_parallel_executions))
            .ok_or_else(|| LoaderError::JobNotFound(job_code.to_string()))?;

        let active = state
            .leases
            .iter()
            .filter(|l| l.job_code == job_code && !l.is_released())
            .count() as i64;
        if active >= ceiling {
            return Ok(None);
        }

        let lease = Lease::new(job_code, holder, now);
        state.leases.push(lease.clone());
        Ok(Some(lease))
    }

    async fn release_lease(&self, lease_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let mut state = self.write();
        match state
            .leases
            .iter_mut()
            .find(|l| l.id == lease_id && !l.is_released())
        {
            Some(lease) => {
                lease.released_at = Some(now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn attach_execution(&self, lease_id: Uuid, execution_id: Uuid) -> Result<()> {
        if let Some(lease) = self.write().leases.iter_mut().find(|l| l.id == lease_id) {
            lease.execution_record_id = Some(execution_id);
        }
        Ok(())
    }

    async fn release_stale_leases(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<u64> {
        let mut state = self.write();
        let mut released = 0;
        for lease in state.leases.iter_mut().filter(|l| l.is_stale(cutoff)) {
            lease.released_at = Some(now);
            released += 1;
        }
        Ok(released)
    }

    async fn active_leases(&self, job_code: Option<&str>) -> Result<Vec<Lease>> {
        Ok(self
            .read()
            .leases
            .iter()
            .filter(|l| !l.is_released())
            .filter(|l| job_code.map_or(true, |code| l.job_code == code))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ExecutionLog for MemoryStore {
    async fn start_execution(
        &self,
        execution: NewExecution,
        start_time: DateTime<Utc>,
    ) -> Result<ExecutionRecord> {
        let record = execution.into_record(start_time);
        self.write().executions.push(record.clone());
        Ok(record)
    }

    async fn finish_execution(&self, id: Uuid, finish: ExecutionFinish) -> Result<bool> {
        let mut state = self.write();
        let Some(record) = state
            .executions
            .iter_mut()
            .find(|r| r.id == id && r.outcome == ExecutionOutcome::Running)
        else {
            return Ok(false);
        };

        record.outcome = finish.outcome;
        record.end_time = Some(finish.end_time);
        record.actual_from = finish.actual.map(|w| w.from);
        record.actual_to = finish.actual.map(|w| w.to);
        record.rows_ingested = finish.rows_ingested;
        record.empty_reason = finish.empty_reason;
        record.error_message = finish.error_message;
        merge_metadata(&mut record.metadata, finish.metadata);
        Ok(true)
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<ExecutionRecord>> {
        Ok(self.read().executions.iter().find(|r| r.id == id).cloned())
    }

    async fn recent_executions(&self, job_code: &str, limit: i64) -> Result<Vec<ExecutionRecord>> {
        let limit = usize::try_from(limit.max(0)).unwrap_or(usize::MAX);
        Ok(self
            .read()
            .executions
            .iter()
            .rev()
            .filter(|r| r.job_code == job_code)
            .take(limit)
            .cloned()
            .collect())
    }
}

/// In-memory signal sink.
#[derive(Default)]
pub struct MemorySignalSink {
    records: RwLock<Vec<SignalRecord>>,
}

impl MemorySignalSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<SignalRecord> {
        self.records.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn in_window(record: &SignalRecord, job_code: &str, window: &TimeWindow) -> bool {
    record.job_code == job_code && window.contains(record.timestamp)
}

#[async_trait]
impl SignalSink for MemorySignalSink {
    async fn append(&self, records: &[SignalRecord]) -> Result<u64> {
        self.records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(records);
        Ok(records.len() as u64)
    }

    async fn count_in_window(&self, job_code: &str, window: &TimeWindow) -> Result<u64> {
        Ok(self
            .records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| in_window(r, job_code, window))
            .count() as u64)
    }

    async fn purge_window(&self, job_code: &str, window: &TimeWindow) -> Result<u64> {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        let before = records.len();
        records.retain(|r| !in_window(r, job_code, window));
        Ok((before - records.len()) as u64)
    }

    async fn existing_keys(&self, job_code: &str, window: &TimeWindow) -> Result<HashSet<SignalKey>> {
        Ok(self
            .records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| in_window(r, job_code, window))
            .map(SignalRecord::key)
            .collect())
    }

    async fn replace_window(
        &self,
        job_code: &str,
        window: &TimeWindow,
        new_records: &[SignalRecord],
    ) -> Result<u64> {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        records.retain(|r| !in_window(r, job_code, window));
        records.extend_from_slice(new_records);
        Ok(new_records.len() as u64)
    }
}
