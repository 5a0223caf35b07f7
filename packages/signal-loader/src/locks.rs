//! Lease-based distributed lock manager.
//!
//! A lease is a datastore row claiming one execution slot of a job. The per-job
//! ceiling (`max_parallel_executions`) is enforced by the store in a single
//! atomic operation; this type adds the holder identity, logging and the
//! best-effort stale-lease sweep.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{debug, error, info};

use crate::config::HolderIdentity;
use crate::error::Result;
use crate::traits::{LeaseStore, LoaderStore};
use crate::types::{Job, Lease};

pub struct LockManager<S: ?Sized = dyn LoaderStore> {
    store: Arc<S>,
    holder: HolderIdentity,
}

impl<S: LeaseStore + ?Sized> LockManager<S> {
    pub fn new(store: Arc<S>, holder: HolderIdentity) -> Self {
        Self { store, holder }
    }

    pub fn holder(&self) -> &HolderIdentity {
        &self.holder
    }

    /// Claim one execution slot for the job.
    ///
    /// `Ok(None)` means the ceiling is reached (another replica or a
    /// concurrent slot owns it). That is an expected outcome, not an error.
    pub async fn try_acquire(&self, job: &Job) -> Result<Option<Lease>> {
        let lease = self
            .store
            .try_acquire_lease(&job.code, self.holder.as_str(), Utc::now())
            .await?;

        match &lease {
            Some(lease) => debug!(
                job_code = %job.code,
                lease_id = %lease.id,
                holder = %self.holder,
                "lease acquired"
            ),
            None => debug!(
                job_code = %job.code,
                max_parallel = job.max_parallel_executions,
                "lease ceiling reached, skipping"
            ),
        }
        Ok(lease)
    }

    /// Release a lease. Releasing an unknown or already-released lease is a no-op.
    pub async fn release(&self, lease: &Lease) -> Result<()> {
        let released = self.store.release_lease(lease.id, Utc::now()).await?;
        if released {
            debug!(job_code = %lease.job_code, lease_id = %lease.id, "lease released");
        } else {
            debug!(lease_id = %lease.id, "lease already released");
        }
        Ok(())
    }

    /// Release leases held longer than `threshold`; their holders are presumed dead.
    ///
    /// Never fails: datastore errors are logged and reported as zero reaped.
    pub async fn cleanup_stale_leases(&self, threshold: Duration) -> u64 {
        let now = Utc::now();
        match self.store.release_stale_leases(now - threshold, now).await {
            Ok(0) => {
                debug!("no stale leases");
                0
            }
            Ok(count) => {
                info!(count, threshold_secs = threshold.num_seconds(), "reaped stale leases");
                count
            }
            Err(e) => {
                error!(error = %e, "stale lease cleanup failed");
                0
            }
        }
    }
}
