//! Load executor: one bounded extraction run for a job under an acquired lease.
//!
//! # Run
//!
//! ```text
//! compute window ──► empty? ──► NothingDue (no record written)
//!       │
//!       ├─► mark RUNNING, append RUNNING execution record
//!       ├─► shift window to source-local time (- offset)
//!       ├─► substitute :fromTime / :toTime
//!       ├─► query source
//!       ├─► transform rows (+ offset back to UTC)
//!       ├─► apply purge strategy, append to sink
//!       └─► success: advance watermark, IDLE, SUCCESS record
//!           failure: FAILED + failed_since, FAILED record, watermark untouched
//! ```

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SchedulerSettings;
use crate::error::{LoaderError, Result};
use crate::substitution::{substitute, LiteralFormat};
use crate::traits::{LoaderStore, SignalSink, SourceResolver};
use crate::transform::ResultTransformer;
use crate::types::{
    EmptyReason, ExecutionFinish, Job, Lease, NewExecution, PurgeStrategy, SignalRecord,
    TimeWindow,
};

/// Result of one run attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The window had no extent; nothing was queried or recorded.
    NothingDue { window: TimeWindow },
    Succeeded {
        execution_id: Uuid,
        window: TimeWindow,
        rows_ingested: u64,
        empty_reason: Option<EmptyReason>,
    },
    Failed {
        execution_id: Uuid,
        kind: &'static str,
        error: String,
    },
}

impl RunOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, RunOutcome::Failed { .. })
    }
}

/// What the load stage produced.
#[derive(Debug)]
struct Loaded {
    format: LiteralFormat,
    rows_returned: usize,
    ingested: u64,
    skipped: usize,
    purged: bool,
    /// Dropped before a window replace because they fall outside it
    out_of_window: usize,
}

impl Loaded {
    fn empty_reason(&self) -> Option<EmptyReason> {
        match (self.ingested, self.rows_returned.saturating_sub(self.out_of_window)) {
            (0, 0) => Some(EmptyReason::NoRows),
            (0, _) => Some(EmptyReason::AllDuplicates),
            _ => None,
        }
    }
}

/// Why the load stage failed.
#[derive(Debug)]
struct RunFailure {
    kind: &'static str,
    message: String,
}

impl From<LoaderError> for RunFailure {
    fn from(err: LoaderError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

pub struct LoadExecutor {
    store: Arc<dyn LoaderStore>,
    sink: Arc<dyn SignalSink>,
    sources: Arc<dyn SourceResolver>,
}

impl LoadExecutor {
    pub fn new(
        store: Arc<dyn LoaderStore>,
        sink: Arc<dyn SignalSink>,
        sources: Arc<dyn SourceResolver>,
    ) -> Self {
        Self {
            store,
            sink,
            sources,
        }
    }

    /// Run the job once under `lease`.
    ///
    /// Load failures are recorded (job FAILED, FAILED execution record) and
    /// returned as `RunOutcome::Failed`. `Err` means the bookkeeping itself
    /// could not be written.
    pub async fn run(
        &self,
        job: &Job,
        lease: &Lease,
        settings: &SchedulerSettings,
    ) -> Result<RunOutcome> {
        let started = Utc::now();
        let window = TimeWindow::compute(job, started, settings.default_lookback());
        if window.is_empty() {
            debug!(job_code = %job.code, %window, "window is empty, nothing due yet");
            return Ok(RunOutcome::NothingDue { window });
        }

        let source_window = window.shift_hours(-job.source_tz_offset_hours);

        self.store.mark_running(&job.code, started).await?;
        let record = self
            .store
            .start_execution(
                NewExecution {
                    job_code: job.code.clone(),
                    requested: window,
                    metadata: json!({
                        "holder": lease.holder,
                        "lease_id": lease.id,
                        "source_tz_offset_hours": job.source_tz_offset_hours,
                        "source_window_from": source_window.from,
                        "source_window_to": source_window.to,
                    }),
                },
                started,
            )
            .await?;
        if let Err(e) = self.store.attach_execution(lease.id, record.id).await {
            warn!(lease_id = %lease.id, error = %e, "failed to link lease to execution record");
        }

        info!(job_code = %job.code, execution_id = %record.id, %window, "run started");

        let timeout = settings.run_timeout();
        let load = AssertUnwindSafe(self.load(job, &window, &source_window)).catch_unwind();
        let result = match tokio::time::timeout(timeout, load).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(panic)) => Err(RunFailure {
                kind: "panic",
                message: format!("run panicked: {}", panic_message(panic.as_ref())),
            }),
            Err(_) => Err(LoaderError::Timeout {
                seconds: timeout.as_secs(),
            }
            .into()),
        };

        match result {
            Ok(loaded) => self.succeed(job, record.id, window, loaded, settings).await,
            Err(failure) => self.fail(job, record.id, failure).await,
        }
    }

    async fn load(
        &self,
        job: &Job,
        window: &TimeWindow,
        source_window: &TimeWindow,
    ) -> std::result::Result<Loaded, RunFailure> {
        let substitution = substitute(&job.query_text, source_window, job.literal_format()?)?;
        debug!(
            job_code = %job.code,
            format = %substitution.format,
            replacements = substitution.replacements,
            "query substituted"
        );

        let connection = self.sources.connect(&job.source_ref).await?;
        let rows = connection.query(&substitution.sql).await?;
        let records = ResultTransformer::new(&job.code, job.source_tz_offset_hours).transform(&rows)?;

        let mut loaded = Loaded {
            format: substitution.format,
            rows_returned: rows.len(),
            ingested: 0,
            skipped: 0,
            purged: false,
            out_of_window: 0,
        };

        match job.purge_strategy {
            PurgeStrategy::FailOnDuplicate => {
                let existing = self.sink.count_in_window(&job.code, window).await?;
                if existing > 0 {
                    return Err(LoaderError::DuplicateWindow {
                        job_code: job.code.clone(),
                        existing,
                    }
                    .into());
                }
                loaded.ingested = self.sink.append(&records).await?;
            }
            PurgeStrategy::PurgeAndReload => {
                // Only the window is purged, so only the window may be reloaded
                let total = records.len();
                let records: Vec<SignalRecord> = records
                    .into_iter()
                    .filter(|r| window.contains(r.timestamp))
                    .collect();
                loaded.out_of_window = total - records.len();
                if loaded.out_of_window > 0 {
                    warn!(
                        job_code = %job.code,
                        dropped = loaded.out_of_window,
                        %window,
                        "source returned rows outside the window"
                    );
                }
                loaded.ingested = self.sink.replace_window(&job.code, window, &records).await?;
                loaded.purged = true;
            }
            PurgeStrategy::SkipDuplicates => {
                let existing = self.sink.existing_keys(&job.code, window).await?;
                let (fresh, skipped) = dedup_records(records, existing);
                loaded.skipped = skipped;
                loaded.ingested = self.sink.append(&fresh).await?;
            }
        }

        Ok(loaded)
    }

    async fn succeed(
        &self,
        job: &Job,
        execution_id: Uuid,
        window: TimeWindow,
        loaded: Loaded,
        settings: &SchedulerSettings,
    ) -> Result<RunOutcome> {
        let empty_reason = loaded.empty_reason();
        let updated = self
            .store
            .record_success(&job.code, window.to, empty_reason.is_some(), Utc::now())
            .await?;

        if empty_reason.is_some() && updated.consecutive_empty_runs == settings.empty_run_warn_threshold
        {
            warn!(
                job_code = %job.code,
                consecutive_empty_runs = updated.consecutive_empty_runs,
                "job keeps returning no data, source may be down"
            );
        }

        let finish = ExecutionFinish::success(
            window,
            i64::try_from(loaded.ingested).unwrap_or(i64::MAX),
            empty_reason,
            json!({
                "literal_format": loaded.format,
                "rows_returned": loaded.rows_returned,
                "skipped_duplicates": loaded.skipped,
                "purged_window": loaded.purged,
                "out_of_window": loaded.out_of_window,
            }),
        );
        self.store.finish_execution(execution_id, finish).await?;

        info!(
            job_code = %job.code,
            execution_id = %execution_id,
            rows = loaded.ingested,
            %window,
            "run succeeded"
        );
        Ok(RunOutcome::Succeeded {
            execution_id,
            window,
            rows_ingested: loaded.ingested,
            empty_reason,
        })
    }

    async fn fail(&self, job: &Job, execution_id: Uuid, failure: RunFailure) -> Result<RunOutcome> {
        warn!(
            job_code = %job.code,
            execution_id = %execution_id,
            kind = failure.kind,
            error = %failure.message,
            "run failed"
        );

        self.store.record_failure(&job.code, Utc::now()).await?;
        self.store
            .finish_execution(
                execution_id,
                ExecutionFinish::failure(&failure.message, json!({ "error_kind": failure.kind })),
            )
            .await?;

        Ok(RunOutcome::Failed {
            execution_id,
            kind: failure.kind,
            error: failure.message,
        })
    }
}

/// Drop records whose natural key is already stored, or repeated earlier in the batch.
fn dedup_records(
    records: Vec<SignalRecord>,
    mut seen: HashSet<crate::types::SignalKey>,
) -> (Vec<SignalRecord>, usize) {
    let total = records.len();
    let fresh: Vec<SignalRecord> = records
        .into_iter()
        .filter(|record| seen.insert(record.key()))
        .collect();
    let skipped = total - fresh.len();
    (fresh, skipped)
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::{MemorySignalSink, MemoryStore};
    use crate::testing::{
        job_definition, signal_row, FailingSink, JobDefinitionExt, MockSourceResolver,
    };
    use crate::traits::{ExecutionLog, JobStore, LeaseStore};
    use crate::types::{ExecutionOutcome, JobStatus};
    use chrono::Duration;

    struct Fixture {
        store: Arc<MemoryStore>,
        sink: Arc<MemorySignalSink>,
        sources: Arc<MockSourceResolver>,
        executor: LoadExecutor,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(MemorySignalSink::new());
        let sources = Arc::new(MockSourceResolver::new());
        let executor = LoadExecutor::new(store.clone(), sink.clone(), sources.clone());
        Fixture {
            store,
            sink,
            sources,
            executor,
        }
    }

    async fn lease_for(store: &MemoryStore, code: &str) -> Lease {
        store
            .try_acquire_lease(code, "test", Utc::now())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn successful_run_advances_watermark_and_records_rows() {
        let f = fixture();
        let start = Utc::now() - Duration::hours(2);
        let job = f
            .store
            .upsert_job(job_definition("orders").initial(start))
            .await
            .unwrap();
        f.sources
            .source("warehouse")
            .respond_with(vec![signal_row(start + Duration::minutes(5), "eu", 3)]);

        let lease = lease_for(&f.store, "orders").await;
        let outcome = f
            .executor
            .run(&job, &lease, &SchedulerSettings::default())
            .await
            .unwrap();

        let RunOutcome::Succeeded { window, rows_ingested, execution_id, .. } = outcome else {
            panic!("expected success, got {outcome:?}");
        };
        assert_eq!(rows_ingested, 1);
        assert_eq!(window.from, start);

        let job = f.store.get_job("orders").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Idle);
        assert_eq!(job.last_watermark, Some(window.to));
        assert_eq!(f.sink.len(), 1);

        let record = f.store.get_execution(execution_id).await.unwrap().unwrap();
        assert_eq!(record.outcome, ExecutionOutcome::Success);
        assert_eq!(record.rows_ingested, 1);
        assert_eq!(record.actual_to, Some(window.to));
        assert_eq!(f.store.lease(lease.id).unwrap().execution_record_id, Some(execution_id));
    }

    #[tokio::test]
    async fn empty_window_is_a_no_op() {
        let f = fixture();
        let job = f.store.upsert_job(job_definition("orders")).await.unwrap();
        // No watermark and no lookback: from == to == now
        let settings = SchedulerSettings {
            default_lookback_secs: 0,
            ..Default::default()
        };

        let lease = lease_for(&f.store, "orders").await;
        let outcome = f.executor.run(&job, &lease, &settings).await.unwrap();

        assert!(matches!(outcome, RunOutcome::NothingDue { .. }));
        assert!(f.store.executions().is_empty());
        let job = f.store.get_job("orders").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Idle);
    }

    #[tokio::test]
    async fn source_failure_marks_job_failed_and_keeps_watermark() {
        let f = fixture();
        let start = Utc::now() - Duration::hours(2);
        let job = f
            .store
            .upsert_job(job_definition("orders").initial(start))
            .await
            .unwrap();
        f.sources.source("warehouse").fail_with("relation \"orders\" does not exist");

        let lease = lease_for(&f.store, "orders").await;
        let outcome = f
            .executor
            .run(&job, &lease, &SchedulerSettings::default())
            .await
            .unwrap();

        assert!(matches!(outcome, RunOutcome::Failed { kind: "source_query", .. }));
        let job = f.store.get_job("orders").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.failed_since.is_some());
        assert_eq!(job.last_watermark, Some(start));

        let record = &f.store.executions()[0];
        assert_eq!(record.outcome, ExecutionOutcome::Failed);
        assert!(record.error_message.as_deref().unwrap().contains("does not exist"));
        assert_eq!(record.metadata["error_kind"], "source_query");
    }

    #[tokio::test]
    async fn transformation_failure_ingests_nothing() {
        let f = fixture();
        let start = Utc::now() - Duration::hours(2);
        let job = f
            .store
            .upsert_job(job_definition("orders").initial(start))
            .await
            .unwrap();
        let mut bad = signal_row(start, "eu", 1);
        bad.shift_remove("ts");
        f.sources
            .source("warehouse")
            .respond_with(vec![signal_row(start, "us", 1), bad]);

        let lease = lease_for(&f.store, "orders").await;
        let outcome = f
            .executor
            .run(&job, &lease, &SchedulerSettings::default())
            .await
            .unwrap();

        assert!(matches!(outcome, RunOutcome::Failed { kind: "transformation", .. }));
        assert!(f.sink.is_empty());
    }

    #[tokio::test]
    async fn fail_on_duplicate_aborts_when_window_has_data() {
        let f = fixture();
        let start = Utc::now() - Duration::hours(2);
        let job = f
            .store
            .upsert_job(job_definition("orders").initial(start))
            .await
            .unwrap();
        f.sink
            .append(&[SignalRecord::new("orders", start + Duration::minutes(1))])
            .await
            .unwrap();
        f.sources
            .source("warehouse")
            .respond_with(vec![signal_row(start + Duration::minutes(5), "eu", 3)]);

        let lease = lease_for(&f.store, "orders").await;
        let outcome = f
            .executor
            .run(&job, &lease, &SchedulerSettings::default())
            .await
            .unwrap();

        assert!(matches!(outcome, RunOutcome::Failed { kind: "duplicate_window", .. }));
        assert_eq!(f.sink.len(), 1);
    }

    #[tokio::test]
    async fn skip_duplicates_inserts_only_new_keys() {
        let f = fixture();
        let start = Utc::now() - Duration::hours(2);
        let slot = start + Duration::minutes(5);
        let job = f
            .store
            .upsert_job(
                job_definition("orders")
                    .initial(start)
                    .strategy(PurgeStrategy::SkipDuplicates),
            )
            .await
            .unwrap();
        f.sink
            .append(&[SignalRecord::new("orders", slot).with_segment("eu")])
            .await
            .unwrap();
        f.sources.source("warehouse").respond_with(vec![
            signal_row(slot, "eu", 3),
            signal_row(slot, "us", 4),
            signal_row(slot, "us", 4),
        ]);

        let lease = lease_for(&f.store, "orders").await;
        let outcome = f
            .executor
            .run(&job, &lease, &SchedulerSettings::default())
            .await
            .unwrap();

        assert!(matches!(outcome, RunOutcome::Succeeded { rows_ingested: 1, .. }));
        assert_eq!(f.sink.len(), 2);
        assert_eq!(f.store.executions()[0].metadata["skipped_duplicates"], 2);
    }

    #[tokio::test]
    async fn all_duplicates_is_an_empty_success() {
        let f = fixture();
        let start = Utc::now() - Duration::hours(2);
        let slot = start + Duration::minutes(5);
        let job = f
            .store
            .upsert_job(
                job_definition("orders")
                    .initial(start)
                    .strategy(PurgeStrategy::SkipDuplicates),
            )
            .await
            .unwrap();
        f.sink
            .append(&[SignalRecord::new("orders", slot).with_segment("eu")])
            .await
            .unwrap();
        f.sources
            .source("warehouse")
            .respond_with(vec![signal_row(slot, "eu", 3)]);

        let lease = lease_for(&f.store, "orders").await;
        let outcome = f
            .executor
            .run(&job, &lease, &SchedulerSettings::default())
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            RunOutcome::Succeeded {
                empty_reason: Some(EmptyReason::AllDuplicates),
                ..
            }
        ));
        let job = f.store.get_job("orders").await.unwrap().unwrap();
        assert_eq!(job.consecutive_empty_runs, 1);
    }

    #[tokio::test]
    async fn sink_failure_marks_job_failed_and_keeps_watermark() {
        let f = fixture();
        let executor = LoadExecutor::new(
            f.store.clone(),
            Arc::new(FailingSink::new("disk full")),
            f.sources.clone(),
        );
        let start = Utc::now() - Duration::hours(2);
        for (code, strategy) in [
            ("appending", PurgeStrategy::FailOnDuplicate),
            ("reloading", PurgeStrategy::PurgeAndReload),
        ] {
            f.store
                .upsert_job(job_definition(code).initial(start).strategy(strategy))
                .await
                .unwrap();
        }
        f.sources
            .source("warehouse")
            .respond_with(vec![signal_row(start + Duration::minutes(5), "eu", 3)]);

        for code in ["appending", "reloading"] {
            let job = f.store.get_job(code).await.unwrap().unwrap();
            let lease = lease_for(&f.store, code).await;
            let outcome = executor
                .run(&job, &lease, &SchedulerSettings::default())
                .await
                .unwrap();

            assert!(matches!(outcome, RunOutcome::Failed { kind: "sink", .. }), "{code}");
            let job = f.store.get_job(code).await.unwrap().unwrap();
            assert_eq!(job.status, JobStatus::Failed);
            assert_eq!(job.last_watermark, Some(start));
        }

        let executions = f.store.executions();
        assert_eq!(executions.len(), 2);
        for record in &executions {
            assert_eq!(record.outcome, ExecutionOutcome::Failed);
            assert_eq!(record.metadata["error_kind"], "sink");
            assert!(record.error_message.as_deref().unwrap().contains("disk full"));
        }
    }

    #[tokio::test]
    async fn purge_and_reload_drops_rows_outside_window() {
        let f = fixture();
        let start = Utc::now() - Duration::hours(2);
        let job = f
            .store
            .upsert_job(
                job_definition("orders")
                    .initial(start)
                    .strategy(PurgeStrategy::PurgeAndReload),
            )
            .await
            .unwrap();
        f.sources.source("warehouse").respond_with(vec![
            signal_row(start + Duration::minutes(5), "eu", 3),
            signal_row(start - Duration::hours(1), "eu", 7),
        ]);

        let lease = lease_for(&f.store, "orders").await;
        let outcome = f
            .executor
            .run(&job, &lease, &SchedulerSettings::default())
            .await
            .unwrap();

        assert!(matches!(outcome, RunOutcome::Succeeded { rows_ingested: 1, .. }));
        assert_eq!(f.sink.len(), 1);
        assert_eq!(f.sink.records()[0].timestamp, start + Duration::minutes(5));
        let metadata = &f.store.executions()[0].metadata;
        assert_eq!(metadata["rows_returned"], 2);
        assert_eq!(metadata["out_of_window"], 1);

        // A rerun over the same window leaves the same records behind
        f.store.release_lease(lease.id, Utc::now()).await.unwrap();
        let mut job = f.store.get_job("orders").await.unwrap().unwrap();
        job.last_watermark = Some(start);
        f.store.insert_job(job.clone());
        let lease = lease_for(&f.store, "orders").await;
        f.executor
            .run(&job, &lease, &SchedulerSettings::default())
            .await
            .unwrap();
        assert_eq!(f.sink.len(), 1);
    }

    #[tokio::test]
    async fn timezone_offset_shifts_query_and_results() {
        let f = fixture();
        let start = chrono::SubsecRound::trunc_subsecs(Utc::now() - Duration::hours(2), 0);
        let job = f
            .store
            .upsert_job(job_definition("orders").initial(start).tz_offset(3))
            .await
            .unwrap();
        // Source stores local time three hours behind the UTC bound
        let local = (start - Duration::hours(3)).naive_utc() + Duration::minutes(10);
        let mut row = signal_row(start, "eu", 1);
        row.insert("ts".into(), local.into());
        let source = f.sources.source("warehouse");
        source.respond_with(vec![row]);

        let lease = lease_for(&f.store, "orders").await;
        f.executor
            .run(&job, &lease, &SchedulerSettings::default())
            .await
            .unwrap();

        let expected_from = (start - Duration::hours(3)).format("%Y-%m-%dT%H:%M:%S").to_string();
        assert!(source.queries()[0].contains(&expected_from));
        assert_eq!(f.sink.records()[0].timestamp, start + Duration::minutes(10));
    }

    #[tokio::test]
    async fn timeout_is_a_failed_run() {
        let f = fixture();
        let start = Utc::now() - Duration::hours(2);
        let job = f
            .store
            .upsert_job(job_definition("orders").initial(start))
            .await
            .unwrap();
        f.sources
            .source("warehouse")
            .delay(std::time::Duration::from_secs(5));

        let settings = SchedulerSettings {
            run_timeout_secs: 1,
            ..Default::default()
        };
        let lease = lease_for(&f.store, "orders").await;
        let outcome = f.executor.run(&job, &lease, &settings).await.unwrap();

        assert!(matches!(outcome, RunOutcome::Failed { kind: "timeout", .. }));
    }

    #[test]
    fn dedup_drops_repeats_within_batch() {
        let ts = Utc::now();
        let records = vec![
            SignalRecord::new("orders", ts).with_segment("eu"),
            SignalRecord::new("orders", ts).with_segment("eu"),
            SignalRecord::new("orders", ts),
        ];
        let (fresh, skipped) = dedup_records(records, HashSet::new());
        assert_eq!(fresh.len(), 2);
        assert_eq!(skipped, 1);
    }
}
