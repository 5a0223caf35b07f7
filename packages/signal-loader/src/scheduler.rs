//! Polling scheduler.
//!
//! Every replica runs the same loop; the shared datastore is the only
//! coordination point. Each tick:
//!
//! 1. reaps stale leases
//! 2. resets FAILED jobs past the recovery threshold to IDLE
//! 3. loads enabled jobs and active lease counts fresh from the store
//! 4. filters to due jobs, IDLE before RUNNING before FAILED
//! 5. for each due job, waits for a worker slot, tries to acquire a lease and
//!    spawns the run; the lease is released whatever the run does
//!
//! No in-memory state is carried between ticks.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{HolderIdentity, SchedulerSettings, SettingsProvider};
use crate::error::Result;
use crate::executor::{panic_message, LoadExecutor, RunOutcome};
use crate::locks::LockManager;
use crate::traits::{LoaderStore, SignalSink, SourceResolver};
use crate::types::{ExecutionRecord, Job, JobStatus, Lease};

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub reaped_leases: u64,
    pub recovered: Vec<String>,
    pub due: Vec<String>,
    /// Lease ceiling reached, or the job was no longer due once leased
    pub skipped: Vec<String>,
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
    /// Lease acquired but the window was empty
    pub nothing_due: Vec<String>,
    /// Skipped because the stored configuration does not validate
    pub invalid: Vec<String>,
}

/// Job as shown to operators.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub job: Job,
    pub effective_status: JobStatus,
    pub active_leases: Vec<Lease>,
}

/// Read-only scheduler state for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerSnapshot {
    pub holder: String,
    pub settings: SchedulerSettings,
    pub jobs: Vec<JobView>,
}

enum RunResult {
    Finished(RunOutcome),
    Errored(String),
}

pub struct Scheduler {
    store: Arc<dyn LoaderStore>,
    locks: Arc<LockManager>,
    executor: Arc<LoadExecutor>,
    settings: Arc<dyn SettingsProvider>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn LoaderStore>,
        sink: Arc<dyn SignalSink>,
        sources: Arc<dyn SourceResolver>,
        settings: Arc<dyn SettingsProvider>,
        holder: HolderIdentity,
    ) -> Self {
        Self {
            locks: Arc::new(LockManager::new(store.clone(), holder)),
            executor: Arc::new(LoadExecutor::new(store.clone(), sink, sources)),
            store,
            settings,
        }
    }

    pub fn holder(&self) -> &HolderIdentity {
        self.locks.holder()
    }

    /// Run one scheduling pass and wait for the runs it started.
    ///
    /// `Err` only when the job list or recovery pass could not be read or
    /// written; per-job failures are reported in the `TickReport`.
    pub async fn tick(&self) -> Result<TickReport> {
        let settings = self.settings.current().clamped();
        let mut report = TickReport {
            reaped_leases: self
                .locks
                .cleanup_stale_leases(settings.stale_lease_threshold())
                .await,
            ..Default::default()
        };

        let now = Utc::now();
        report.recovered = self
            .store
            .recover_failed_jobs(now - settings.recovery_threshold())
            .await?;
        for code in &report.recovered {
            info!(job_code = %code, "job recovered from FAILED");
        }

        let jobs = self.store.list_enabled_jobs().await?;
        let active = self.store.active_lease_counts().await?;
        let due = self.due_jobs(jobs, &active, &mut report);
        report.due = due.iter().map(|j| j.code.clone()).collect();

        if due.is_empty() {
            debug!("no jobs due");
            return Ok(report);
        }

        let slots = Arc::new(Semaphore::new(settings.worker_pool_size));
        let mut runs = JoinSet::new();

        for job in due {
            let Ok(permit) = slots.clone().acquire_owned().await else {
                break;
            };

            let lease = match self.locks.try_acquire(&job).await {
                Ok(Some(lease)) => lease,
                Ok(None) => {
                    report.skipped.push(job.code.clone());
                    continue;
                }
                Err(e) => {
                    warn!(job_code = %job.code, error = %e, "lease acquisition failed");
                    report.failed.push(job.code.clone());
                    continue;
                }
            };

            // The listing may be stale after waiting for a slot
            let job = match self.still_due(&job.code).await {
                Ok(Some(fresh)) => fresh,
                Ok(None) => {
                    debug!(job_code = %job.code, "job no longer due after acquiring lease");
                    self.release_unused(&lease).await;
                    report.skipped.push(job.code.clone());
                    continue;
                }
                Err(e) => {
                    warn!(job_code = %job.code, error = %e, "failed to re-read job");
                    self.release_unused(&lease).await;
                    report.failed.push(job.code.clone());
                    continue;
                }
            };

            let store = self.store.clone();
            let locks = self.locks.clone();
            let executor = self.executor.clone();
            let settings = settings.clone();
            runs.spawn(async move {
                let _permit = permit;
                let result = run_under_lease(&executor, &locks, &job, lease, &settings).await;
                if let RunResult::Errored(_) = &result {
                    // Keep the job out of RUNNING so recovery picks it up
                    if let Err(e) = store.record_failure(&job.code, Utc::now()).await {
                        error!(job_code = %job.code, error = %e, "failed to record run failure");
                    }
                }
                (job.code, result)
            });
        }

        while let Some(joined) = runs.join_next().await {
            match joined {
                Ok((code, RunResult::Finished(outcome))) => match outcome {
                    RunOutcome::NothingDue { .. } => report.nothing_due.push(code),
                    RunOutcome::Succeeded { .. } => report.succeeded.push(code),
                    RunOutcome::Failed { .. } => report.failed.push(code),
                },
                Ok((code, RunResult::Errored(message))) => {
                    warn!(job_code = %code, error = %message, "run errored");
                    report.failed.push(code);
                }
                Err(e) => error!(error = %e, "run task aborted"),
            }
        }

        info!(
            due = report.due.len(),
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "tick complete"
        );
        Ok(report)
    }

    /// Re-read a job while holding one of its leases. `None` when it was
    /// removed, disabled or already advanced by another replica.
    async fn still_due(&self, code: &str) -> Result<Option<Job>> {
        let Some(job) = self.store.get_job(code).await? else {
            return Ok(None);
        };
        if job.validate().is_err() {
            return Ok(None);
        }
        // Our own lease is among the active ones
        let others = self.store.active_leases(Some(code)).await?.len().saturating_sub(1);
        let others = i64::try_from(others).unwrap_or(i64::MAX);
        Ok(job.is_due(Utc::now(), others).then_some(job))
    }

    async fn release_unused(&self, lease: &Lease) {
        if let Err(e) = self.locks.release(lease).await {
            error!(job_code = %lease.job_code, lease_id = %lease.id, error = %e, "failed to release lease");
        }
    }

    fn due_jobs(
        &self,
        jobs: Vec<Job>,
        active: &HashMap<String, i64>,
        report: &mut TickReport,
    ) -> Vec<Job> {
        let now = Utc::now();
        let mut due: Vec<Job> = jobs
            .into_iter()
            .filter(|job| {
                if let Err(e) = job.validate() {
                    warn!(job_code = %job.code, error = %e, "skipping job with invalid configuration");
                    report.invalid.push(job.code.clone());
                    return false;
                }
                job.is_due(now, active.get(&job.code).copied().unwrap_or(0))
            })
            .collect();

        // Stable: ties keep the store's ordering
        due.sort_by_key(|job| job.status.schedule_rank());
        due
    }

    /// Tick until `shutdown` fires. In-flight runs finish before the loop exits.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(holder = %self.holder(), "scheduler starting");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            if let Err(e) = self.tick().await {
                error!(error = %e, "tick failed");
            }

            let interval = self.settings.current().clamped().tick_interval();
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        info!(holder = %self.holder(), "scheduler stopped");
    }

    /// Reset every enabled FAILED job to IDLE now, ignoring the recovery threshold.
    pub async fn force_recovery(&self) -> Result<Vec<String>> {
        let recovered = self.store.recover_failed_jobs(Utc::now()).await?;
        info!(count = recovered.len(), "forced recovery");
        Ok(recovered)
    }

    /// Run the stale-lease sweep now with the current threshold.
    pub async fn force_lease_cleanup(&self) -> u64 {
        let threshold = self.settings.current().stale_lease_threshold();
        self.locks.cleanup_stale_leases(threshold).await
    }

    pub async fn snapshot(&self) -> Result<SchedulerSnapshot> {
        let jobs = self.store.list_jobs().await?;
        let mut leases: HashMap<String, Vec<Lease>> = HashMap::new();
        for lease in self.store.active_leases(None).await? {
            leases.entry(lease.job_code.clone()).or_default().push(lease);
        }

        Ok(SchedulerSnapshot {
            holder: self.holder().to_string(),
            settings: self.settings.current(),
            jobs: jobs
                .into_iter()
                .map(|job| JobView {
                    effective_status: job.effective_status(),
                    active_leases: leases.remove(&job.code).unwrap_or_default(),
                    job,
                })
                .collect(),
        })
    }

    pub async fn recent_executions(&self, job_code: &str, limit: i64) -> Result<Vec<ExecutionRecord>> {
        self.store.recent_executions(job_code, limit).await
    }
}

/// Execute one run and always release the lease, even if the run panics.
async fn run_under_lease(
    executor: &LoadExecutor,
    locks: &LockManager,
    job: &Job,
    lease: Lease,
    settings: &SchedulerSettings,
) -> RunResult {
    let result = AssertUnwindSafe(executor.run(job, &lease, settings))
        .catch_unwind()
        .await;

    if let Err(e) = locks.release(&lease).await {
        // The reaper frees it once it goes stale
        error!(job_code = %job.code, lease_id = %lease.id, error = %e, "failed to release lease");
    }

    match result {
        Ok(Ok(outcome)) => RunResult::Finished(outcome),
        Ok(Err(e)) => RunResult::Errored(e.to_string()),
        Err(panic) => RunResult::Errored(format!("run panicked: {}", panic_message(panic.as_ref()))),
    }
}
