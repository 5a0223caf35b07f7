//! Postgres coordination store, signal sink and source registry.
//!
//! These need Docker: `cargo test -- --ignored`.

mod common;

use std::sync::Arc;

use chrono::{Duration, SubsecRound, Utc};
use serde_json::json;
use signal_loader::testing::{job_definition, JobDefinitionExt};
use signal_loader::{
    ColumnValue, ExecutionFinish, ExecutionLog, ExecutionOutcome, HolderIdentity, JobDefinition,
    JobStatus, JobStore, LeaseStore, LoadExecutor, LockManager, NewExecution, PurgeStrategy,
    RunOutcome, SchedulerSettings, SignalRecord, SignalSink, SourceResolver, TimeWindow,
};
use test_context::test_context;

use crate::common::{unique_code, TestHarness, SOURCE_REF};

fn source_query(table: &str) -> String {
    format!("SELECT ts, segment, count FROM {table} WHERE ts >= :fromTime AND ts < :toTime")
}

// =============================================================================
// Jobs
// =============================================================================

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires Docker"]
async fn upsert_keeps_runtime_state(ctx: &TestHarness) {
    let code = unique_code("orders");
    let watermark = Utc::now().trunc_subsecs(0) - Duration::hours(1);
    ctx.store
        .upsert_job(
            job_definition(&code)
                .initial(watermark)
                .strategy(PurgeStrategy::SkipDuplicates),
        )
        .await
        .unwrap();
    ctx.store.record_failure(&code, Utc::now()).await.unwrap();

    let updated = ctx
        .store
        .upsert_job(job_definition(&code).min_interval(900))
        .await
        .unwrap();

    assert_eq!(updated.min_interval_seconds, 900);
    assert_eq!(updated.purge_strategy, PurgeStrategy::FailOnDuplicate);
    assert_eq!(updated.status, JobStatus::Failed);
    assert_eq!(updated.last_watermark, Some(watermark));
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires Docker"]
async fn invalid_definition_is_rejected(ctx: &TestHarness) {
    let definition = JobDefinition::builder()
        .code(unique_code("bad"))
        .query_text("SELECT * FROM t WHERE ts >= :fromTime")
        .source_ref(SOURCE_REF)
        .build();

    let err = ctx.store.upsert_job(definition).await.unwrap_err();
    assert!(err.is_validation());
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires Docker"]
async fn watermark_never_moves_backwards(ctx: &TestHarness) {
    let code = unique_code("orders");
    let later = Utc::now().trunc_subsecs(0);
    ctx.store.upsert_job(job_definition(&code)).await.unwrap();

    ctx.store.record_success(&code, later, false, Utc::now()).await.unwrap();
    let job = ctx
        .store
        .record_success(&code, later - Duration::hours(2), true, Utc::now())
        .await
        .unwrap();

    assert_eq!(job.last_watermark, Some(later));
    assert_eq!(job.consecutive_empty_runs, 1);
    assert_eq!(job.status, JobStatus::Idle);
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires Docker"]
async fn recovery_uses_failed_since_cutoff(ctx: &TestHarness) {
    let old = unique_code("old");
    let fresh = unique_code("fresh");
    let now = Utc::now();
    for code in [&old, &fresh] {
        ctx.store.upsert_job(job_definition(code)).await.unwrap();
    }
    ctx.store.record_failure(&old, now - Duration::minutes(21)).await.unwrap();
    ctx.store.record_failure(&fresh, now - Duration::minutes(10)).await.unwrap();

    let recovered = ctx
        .store
        .recover_failed_jobs(now - Duration::minutes(20))
        .await
        .unwrap();

    assert!(recovered.contains(&old));
    assert!(!recovered.contains(&fresh));
    let job = ctx.store.get_job(&old).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Idle);
    assert!(job.failed_since.is_none());
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires Docker"]
async fn disabled_job_is_not_listed_as_enabled(ctx: &TestHarness) {
    let code = unique_code("orders");
    ctx.store.upsert_job(job_definition(&code)).await.unwrap();
    ctx.store.set_enabled(&code, false).await.unwrap();

    let enabled = ctx.store.list_enabled_jobs().await.unwrap();
    assert!(enabled.iter().all(|j| j.code != code));

    let job = ctx.store.get_job(&code).await.unwrap().unwrap();
    assert_eq!(job.effective_status(), JobStatus::Paused);
}

// =============================================================================
// Leases
// =============================================================================

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires Docker"]
async fn lease_ceiling_holds_across_connections(ctx: &TestHarness) {
    let code = unique_code("orders");
    ctx.store
        .upsert_job(job_definition(&code).parallel(2))
        .await
        .unwrap();

    let mut attempts = tokio::task::JoinSet::new();
    for i in 0..5 {
        let store = ctx.store.clone();
        let code = code.clone();
        attempts.spawn(async move {
            store
                .try_acquire_lease(&code, &format!("replica-{i}"), Utc::now())
                .await
                .unwrap()
        });
    }

    let mut acquired = 0;
    while let Some(result) = attempts.join_next().await {
        if result.unwrap().is_some() {
            acquired += 1;
        }
    }

    assert_eq!(acquired, 2);
    assert_eq!(ctx.store.active_leases(Some(&code)).await.unwrap().len(), 2);
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires Docker"]
async fn released_lease_frees_a_slot(ctx: &TestHarness) {
    let code = unique_code("orders");
    ctx.store.upsert_job(job_definition(&code)).await.unwrap();

    let lease = ctx
        .store
        .try_acquire_lease(&code, "replica-a", Utc::now())
        .await
        .unwrap()
        .unwrap();
    assert!(ctx
        .store
        .try_acquire_lease(&code, "replica-b", Utc::now())
        .await
        .unwrap()
        .is_none());

    assert!(ctx.store.release_lease(lease.id, Utc::now()).await.unwrap());
    assert!(!ctx.store.release_lease(lease.id, Utc::now()).await.unwrap());
    assert!(ctx
        .store
        .try_acquire_lease(&code, "replica-b", Utc::now())
        .await
        .unwrap()
        .is_some());
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires Docker"]
async fn stale_leases_are_reaped(ctx: &TestHarness) {
    let code = unique_code("orders");
    ctx.store
        .upsert_job(job_definition(&code).parallel(2))
        .await
        .unwrap();
    let now = Utc::now();
    let stale = ctx
        .store
        .try_acquire_lease(&code, "dead", now - Duration::hours(3))
        .await
        .unwrap()
        .unwrap();
    let live = ctx
        .store
        .try_acquire_lease(&code, "alive", now - Duration::minutes(30))
        .await
        .unwrap()
        .unwrap();

    let locks = LockManager::new(Arc::new(ctx.store.clone()), HolderIdentity::new("replica-a"));
    assert!(locks.cleanup_stale_leases(Duration::hours(2)).await >= 1);

    let active = ctx.store.active_leases(Some(&code)).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, live.id);
    assert_ne!(active[0].id, stale.id);
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires Docker"]
async fn acquiring_for_unknown_job_is_an_error(ctx: &TestHarness) {
    let result = ctx
        .store
        .try_acquire_lease(&unique_code("missing"), "replica-a", Utc::now())
        .await;
    assert!(result.is_err());
}

// =============================================================================
// Execution history
// =============================================================================

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires Docker"]
async fn finished_execution_is_not_rewritten(ctx: &TestHarness) {
    let code = unique_code("orders");
    ctx.store.upsert_job(job_definition(&code)).await.unwrap();
    let now = Utc::now().trunc_subsecs(0);
    let window = TimeWindow::new(now - Duration::hours(1), now);

    let record = ctx
        .store
        .start_execution(
            NewExecution {
                job_code: code.clone(),
                requested: window,
                metadata: json!({ "holder": "replica-a" }),
            },
            now,
        )
        .await
        .unwrap();
    assert_eq!(record.outcome, ExecutionOutcome::Running);

    let finished = ctx
        .store
        .finish_execution(
            record.id,
            ExecutionFinish::success(window, 3, None, json!({ "rows_returned": 3 })),
        )
        .await
        .unwrap();
    assert!(finished);

    let again = ctx
        .store
        .finish_execution(record.id, ExecutionFinish::failure("late", json!({})))
        .await
        .unwrap();
    assert!(!again);

    let stored = ctx.store.get_execution(record.id).await.unwrap().unwrap();
    assert_eq!(stored.outcome, ExecutionOutcome::Success);
    assert_eq!(stored.rows_ingested, 3);
    assert_eq!(stored.metadata["holder"], "replica-a");
    assert_eq!(stored.metadata["rows_returned"], 3);
}

// =============================================================================
// Signal sink
// =============================================================================

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires Docker"]
async fn sink_window_operations_are_half_open(ctx: &TestHarness) {
    let code = unique_code("orders");
    let now = Utc::now().trunc_subsecs(0);
    let window = TimeWindow::new(now - Duration::hours(1), now);
    let records = vec![
        SignalRecord::new(&code, window.from).with_segment("eu").with_count(1),
        SignalRecord::new(&code, now - Duration::minutes(30)).with_count(2),
        SignalRecord::new(&code, window.to).with_segment("eu").with_count(3),
    ];
    assert_eq!(ctx.sink.append(&records).await.unwrap(), 3);

    assert_eq!(ctx.sink.count_in_window(&code, &window).await.unwrap(), 2);
    let keys = ctx.sink.existing_keys(&code, &window).await.unwrap();
    assert!(keys.contains(&records[0].key()));
    assert!(keys.contains(&records[1].key()));
    assert!(!keys.contains(&records[2].key()));

    let replacement = vec![SignalRecord::new(&code, now - Duration::minutes(5)).with_count(9)];
    assert_eq!(ctx.sink.replace_window(&code, &window, &replacement).await.unwrap(), 1);

    let stored = ctx.sink.records_for_job(&code).await.unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0].count, Some(9));
    assert_eq!(stored[1].timestamp, window.to);
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires Docker"]
async fn failed_window_replace_keeps_stored_records(ctx: &TestHarness) {
    let code = unique_code("orders");
    let now = Utc::now().trunc_subsecs(0);
    let window = TimeWindow::new(now - Duration::hours(1), now);
    let stored = SignalRecord::new(&code, now - Duration::minutes(30)).with_count(1);
    ctx.sink.append(std::slice::from_ref(&stored)).await.unwrap();

    // Postgres rejects NUL bytes in text, so the insert fails after the delete
    let replacement = vec![
        SignalRecord::new(&code, now - Duration::minutes(20)).with_count(2),
        SignalRecord::new("bad\0code", now - Duration::minutes(10)).with_count(3),
    ];
    let err = ctx
        .sink
        .replace_window(&code, &window, &replacement)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "sink");

    let kept = ctx.sink.records_for_job(&code).await.unwrap();
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0].count, Some(1));
}

// =============================================================================
// End to end
// =============================================================================

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires Docker"]
async fn run_loads_rows_from_source_table(ctx: &TestHarness) {
    let code = unique_code("orders");
    let table = format!("events_{}", code);
    let now = Utc::now().trunc_subsecs(0);
    ctx.create_source_table(&table).await.unwrap();
    ctx.insert_source_row(&table, now - Duration::minutes(50), "eu", 4)
        .await
        .unwrap();
    ctx.insert_source_row(&table, now - Duration::minutes(10), "us", 7)
        .await
        .unwrap();
    ctx.insert_source_row(&table, now - Duration::hours(3), "eu", 100)
        .await
        .unwrap();

    let mut definition = job_definition(&code).initial(now - Duration::hours(1));
    definition.query_text = source_query(&table);
    let job = ctx.store.upsert_job(definition).await.unwrap();

    let store = Arc::new(ctx.store.clone());
    let locks = LockManager::new(store.clone(), HolderIdentity::new("replica-a"));
    let executor = LoadExecutor::new(
        store,
        Arc::new(ctx.sink.clone()),
        Arc::new(ctx.source_registry()),
    );

    let lease = locks.try_acquire(&job).await.unwrap().unwrap();
    let outcome = executor
        .run(&job, &lease, &SchedulerSettings::default())
        .await
        .unwrap();
    locks.release(&lease).await.unwrap();

    let RunOutcome::Succeeded { rows_ingested, window, .. } = outcome else {
        panic!("expected success, got {outcome:?}");
    };
    assert_eq!(rows_ingested, 2);

    let stored = ctx.sink.records_for_job(&code).await.unwrap();
    assert_eq!(
        stored,
        vec![
            SignalRecord::new(&code, now - Duration::minutes(50)).with_segment("eu").with_count(4),
            SignalRecord::new(&code, now - Duration::minutes(10)).with_segment("us").with_count(7),
        ]
    );

    let job = ctx.store.get_job(&code).await.unwrap().unwrap();
    assert_eq!(job.last_watermark, Some(window.to));
    assert_eq!(job.status, JobStatus::Idle);
    assert!(ctx.store.active_leases(Some(&code)).await.unwrap().is_empty());
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires Docker"]
async fn run_against_missing_table_fails_and_keeps_watermark(ctx: &TestHarness) {
    let code = unique_code("orders");
    let watermark = Utc::now().trunc_subsecs(0) - Duration::hours(1);
    let mut definition = job_definition(&code).initial(watermark);
    definition.query_text = source_query("no_such_table");
    let job = ctx.store.upsert_job(definition).await.unwrap();

    let store = Arc::new(ctx.store.clone());
    let locks = LockManager::new(store.clone(), HolderIdentity::new("replica-a"));
    let executor = LoadExecutor::new(
        store,
        Arc::new(ctx.sink.clone()),
        Arc::new(ctx.source_registry()),
    );

    let lease = locks.try_acquire(&job).await.unwrap().unwrap();
    let outcome = executor
        .run(&job, &lease, &SchedulerSettings::default())
        .await
        .unwrap();
    locks.release(&lease).await.unwrap();

    assert!(outcome.is_failure());
    let job = ctx.store.get_job(&code).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.last_watermark, Some(watermark));

    let history = ctx.store.recent_executions(&code, 5).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].outcome, ExecutionOutcome::Failed);
    assert_eq!(history[0].metadata["error_kind"], "source_query");
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires Docker"]
async fn source_rows_decode_by_column_type(ctx: &TestHarness) {
    let connection = ctx
        .source_registry()
        .connect(SOURCE_REF)
        .await
        .unwrap();
    let rows = connection
        .query("SELECT 1::int4 AS a, 2.50::numeric AS b, 'x'::text AS c, NULL::int8 AS d, now() AS e")
        .await
        .unwrap();

    let row = &rows[0];
    assert_eq!(row["a"], ColumnValue::Int(1));
    assert_eq!(row["b"], ColumnValue::Float(2.5));
    assert_eq!(row["c"], ColumnValue::Text("x".into()));
    assert_eq!(row["d"], ColumnValue::Null);
    assert!(matches!(row["e"], ColumnValue::TimestampTz(_)));
}
