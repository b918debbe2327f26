//! Run control across tenants and processes, and how runs end when the store
//! or the lock goes away underneath them.

mod common;

use std::time::Duration;

use tokio::time::Instant;

use common::*;
use mailsift::analysis::AnalysisFailure;
use mailsift::events::EventKind;
use mailsift::lock::{LockConfig, LockKind};
use mailsift::pipeline::{PipelineConfig, RunStatus};
use mailsift::task::{REASON_LOCKED, Trigger};
use mailsift::testing::FakeBehavior;

async fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn analysis_rows(h: &Harness) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM analysis_results WHERE tenant_id = ?")
        .bind(TENANT)
        .fetch_one(&h.db.pool)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_pre_empted_background_run_stops_before_writing() {
    let config = PipelineConfig {
        call_timeout: Duration::from_secs(5),
        ..Default::default()
    };
    // Heartbeat every 200ms.
    let lock_config = LockConfig {
        expiry: Duration::from_millis(600),
        ..test_lock_config()
    };
    let h = Harness::build(config, lock_config).await;
    h.add_messages(TENANT, 1..=3);
    for id in 1..=3 {
        h.analyzer.script(
            &format!("message {id}"),
            FakeBehavior::Delay(Duration::from_millis(1500)),
        );
    }

    let background = h
        .controller
        .start(TENANT, Trigger::Scheduled, options(3))
        .await
        .unwrap();
    assert!(background.started);
    wait_until("background analyses to start", || h.analyzer.calls() == 3).await;

    let other = h.second_process();
    let manual = other
        .controller
        .start(TENANT, Trigger::Manual, options(3))
        .await
        .unwrap();
    assert!(manual.started, "{:?}", manual.reason);

    // The background run notices well before its analyses would return.
    let pre_empted = tokio::time::timeout(
        Duration::from_millis(1000),
        h.controller.wait_finished(TENANT),
    )
    .await
    .expect("pre-empted run kept going")
    .unwrap();
    assert_eq!(pre_empted.status, RunStatus::Error);
    assert!(!h.controller.is_running(TENANT));

    let events = h.current_run_events(TENANT);
    assert_single_terminal(&events);
    match &events.last().unwrap().kind {
        EventKind::Error { fatal, reason, .. } => {
            assert!(*fatal);
            assert!(reason.contains("taken over"), "{reason}");
        }
        other => panic!("unexpected terminal {other:?}"),
    }

    let finished = other.controller.wait_finished(TENANT).await.unwrap();
    assert_eq!(finished.status, RunStatus::Completed);

    // Only the surviving run analyzed and wrote anything.
    assert_eq!(h.analyzer.calls(), 3);
    assert_eq!(other.analyzer.calls(), 3);
    assert_eq!(h.counts(TENANT).await.analyzed, 3);
    assert_eq!(analysis_rows(&h).await, 3);
    assert_eq!(h.watermark(TENANT).await, 3);
    assert!(h.lock.holder(TENANT).await.unwrap().is_none());
}

#[tokio::test]
async fn test_contended_tenant_does_not_delay_other_tenants() {
    let h = Harness::new().await;
    let other = h.foreign_lock("other-process");
    assert!(
        other
            .acquire(TENANT, LockKind::Stream, Duration::ZERO)
            .await
            .unwrap()
    );

    // Waits the full 200ms lock timeout before giving up.
    let controller = h.controller.clone();
    let contended = tokio::spawn(async move {
        controller
            .start(TENANT, Trigger::Scheduled, options(1))
            .await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let began = Instant::now();
    let response = h.controller.start(2, Trigger::Manual, options(1)).await.unwrap();
    let elapsed = began.elapsed();
    assert!(response.started, "{:?}", response.reason);
    assert!(elapsed < Duration::from_millis(120), "start took {elapsed:?}");

    let contended = contended.await.unwrap().unwrap();
    assert!(!contended.started);
    assert_eq!(contended.reason.as_deref(), Some(REASON_LOCKED));
    h.controller.wait_finished(2).await.unwrap();
}

#[tokio::test]
async fn test_store_failure_ends_run_with_fatal_error() {
    let h = Harness::new().await;
    h.add_messages(TENANT, [1, 2]);
    // Records still insert; the first write-back fails.
    sqlx::query("DROP TABLE analysis_results")
        .execute(&h.db.pool)
        .await
        .unwrap();

    let response = h
        .controller
        .start(TENANT, Trigger::Manual, options(2))
        .await
        .unwrap();
    assert!(response.started);
    let finished = h.controller.wait_finished(TENANT).await.unwrap();
    assert_eq!(finished.status, RunStatus::Error);

    let events = h.current_run_events(TENANT);
    assert_single_terminal(&events);
    let terminal = events.last().unwrap();
    match &terminal.kind {
        EventKind::Error {
            fatal, id, record_id, ..
        } => {
            assert!(*fatal);
            assert!(id.is_none());
            assert!(record_id.is_none());
        }
        other => panic!("unexpected terminal {other:?}"),
    }
    assert!(!events.iter().any(|e| e.kind.status() == "analyzed"));

    assert_eq!(h.watermark(TENANT).await, 0);
    assert!(h.lock.holder(TENANT).await.unwrap().is_none());

    let snapshot = h.controller.status(TENANT);
    assert!(!snapshot.active);
    assert_eq!(snapshot.run.unwrap().status, RunStatus::Error);
    assert_eq!(snapshot.last_event.unwrap().seq, terminal.seq);
}

#[tokio::test]
async fn test_failed_analyses_never_stay_analyzing() {
    let h = Harness::new().await;
    h.add_messages(TENANT, 1..=3);
    h.analyzer.script(
        "message 1",
        FakeBehavior::Fail(AnalysisFailure::Malformed("not json".to_string())),
    );
    h.analyzer.script("message 2", FakeBehavior::Panic);
    h.analyzer
        .script("message 3", FakeBehavior::Delay(Duration::from_secs(2)));

    let events = h.run_manual(TENANT, options(3)).await;

    assert_eq!(terminal_counters(&events).failed, 3);
    let counts = h.counts(TENANT).await;
    assert_eq!(counts.analyzing, 0);
    assert_eq!(counts.failed, 3);
    for id in 1..=3 {
        let record = h.record_by_source_id(TENANT, id).await;
        assert!(record.last_error.is_some(), "record {id} has no error");
    }
    // Completion order across workers is not fixed.
    let mut failed = ids_with_status(&events, "error");
    failed.sort_unstable();
    assert_eq!(failed, vec![1, 2, 3]);
}
