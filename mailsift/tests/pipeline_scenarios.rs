//! End-to-end runs over a temp database with in-memory collaborators.

mod common;

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use common::*;
use mailsift::database::models::{LockDbModel, RecordStatus};
use mailsift::database::repositories::{LockRepository, SqlxLockRepository};
use mailsift::database::time::now_ms;
use mailsift::events::EventKind;
use mailsift::lock::LockKind;
use mailsift::pipeline::{PipelineConfig, RunOutcome, RunStatus};
use mailsift::task::{REASON_ALREADY_RUNNING, REASON_LOCKED, Trigger};
use mailsift::testing::FakeBehavior;

#[tokio::test]
async fn test_empty_source_completes_without_work() {
    let h = Harness::new().await;

    let events = h.run_manual(TENANT, options(3)).await;

    assert_eq!(statuses(&events), vec!["started", "stats", "completed"]);
    match &events[1].kind {
        EventKind::Stats { candidates, .. } => assert_eq!(*candidates, 0),
        other => panic!("unexpected {other:?}"),
    }
    let counters = terminal_counters(&events);
    assert_eq!(counters.saved, 0);
    assert_eq!(counters.analyzed, 0);
    assert_eq!(h.watermark(TENANT).await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_new_ids_are_saved_in_order_and_analyzed() {
    let h = Harness::new().await;
    h.cursor.advance(TENANT, 100).await.unwrap();
    h.add_messages(TENANT, [99, 100, 101, 102, 103]);

    let events = h.run_manual(TENANT, options(2)).await;

    assert_eq!(ids_with_status(&events, "saved"), vec![101, 102, 103]);
    let mut analyzing = ids_with_status(&events, "analyzing");
    analyzing.sort_unstable();
    assert_eq!(analyzing, vec![101, 102, 103]);
    let mut analyzed = ids_with_status(&events, "analyzed");
    analyzed.sort_unstable();
    assert_eq!(analyzed, vec![101, 102, 103]);

    assert_single_terminal(&events);
    let counters = terminal_counters(&events);
    assert_eq!(counters.saved, 3);
    assert_eq!(counters.analyzed, 3);
    assert_eq!(h.watermark(TENANT).await, 103);
    assert_eq!(h.counts(TENANT).await.analyzed, 3);
    assert_eq!(h.source.full_fetches(), vec![101, 102, 103]);
}

#[tokio::test]
async fn test_analysis_timeout_marks_record_failed() {
    let h = Harness::new().await;
    h.cursor.advance(TENANT, 103).await.unwrap();
    h.add_messages(TENANT, [104, 105]);
    h.analyzer
        .script("message 105", FakeBehavior::Delay(Duration::from_secs(5)));

    let events = h.run_manual(TENANT, options(2)).await;

    let timeout = events.iter().find_map(|e| match &e.kind {
        EventKind::Error {
            id: Some(105),
            reason,
            fatal: false,
            ..
        } => Some(reason.clone()),
        _ => None,
    });
    assert_eq!(timeout.as_deref(), Some("timeout"));

    let record = h.record_by_source_id(TENANT, 105).await;
    assert_eq!(record.status(), RecordStatus::Failed);
    assert_eq!(record.last_error.as_deref(), Some("timeout"));
    assert_eq!(h.record_by_source_id(TENANT, 104).await.status(), RecordStatus::Analyzed);

    assert_eq!(events.last().map(|e| e.kind.status()), Some("completed"));
    assert_eq!(h.watermark(TENANT).await, 105);
}

#[tokio::test]
async fn test_start_while_analyzing_is_rejected() {
    let h = Harness::with_config(PipelineConfig {
        call_timeout: Duration::from_secs(5),
        ..Default::default()
    })
    .await;
    h.add_messages(TENANT, [1]);
    h.analyzer
        .script("message 1", FakeBehavior::Delay(Duration::from_millis(800)));

    let first = h
        .controller
        .start(TENANT, Trigger::Manual, options(1))
        .await
        .unwrap();
    assert!(first.started);

    let mut status = None;
    for _ in 0..200 {
        status = h.controller.status(TENANT).run.map(|run| run.status);
        if status == Some(RunStatus::Analyzing) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(status, Some(RunStatus::Analyzing));

    let second = h
        .controller
        .start(TENANT, Trigger::Manual, options(1))
        .await
        .unwrap();
    assert!(!second.started);
    assert_eq!(second.reason.as_deref(), Some(REASON_ALREADY_RUNNING));
    assert_eq!(second.status, Some(RunStatus::Analyzing));

    let finished = h.controller.wait_finished(TENANT).await.unwrap();
    assert_eq!(finished.status, RunStatus::Completed);
    assert_eq!(finished.run_id, first.run_id.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_after_two_saves_stops_fetching() {
    let h = Harness::new().await;
    h.add_messages(TENANT, 1..=5);
    let cancel = CancellationToken::new();
    h.source.cancel_after_full_fetches(2, cancel.clone());

    let (outcome, events) = h.run_direct(TENANT, options(1), cancel).await;

    assert!(matches!(outcome, RunOutcome::Cancelled(_)));
    assert_eq!(h.source.full_fetches(), vec![1, 2]);
    assert_eq!(ids_with_status(&events, "saved"), vec![1, 2]);
    assert_single_terminal(&events);
    assert_eq!(events.last().map(|e| e.kind.status()), Some("cancelled"));

    let counts = h.counts(TENANT).await;
    assert_eq!(counts.analyzing, 0);
    assert_eq!(counts.total(), 2);
    assert_eq!(counts.analyzed + counts.unanalyzed, 2);
    assert_eq!(h.watermark(TENANT).await, 0);

    // The next run finishes the leftovers without fetching them again.
    let (outcome, _) = h
        .run_direct(TENANT, options(2), CancellationToken::new())
        .await;
    assert!(matches!(outcome, RunOutcome::Completed(_)));
    assert_eq!(h.source.full_fetches(), vec![1, 2, 3, 4, 5]);
    assert_eq!(h.counts(TENANT).await.analyzed, 5);
    assert_eq!(h.watermark(TENANT).await, 5);
}

#[tokio::test]
async fn test_stop_through_controller_ends_with_cancelled() {
    let h = Harness::with_config(PipelineConfig {
        call_timeout: Duration::from_secs(5),
        ..Default::default()
    })
    .await;
    h.add_messages(TENANT, 1..=3);
    h.analyzer
        .script("message 1", FakeBehavior::Delay(Duration::from_millis(300)));

    assert!(!h.controller.stop(TENANT));
    let started = h
        .controller
        .start(TENANT, Trigger::Manual, options(1))
        .await
        .unwrap();
    assert!(started.started);
    assert!(h.controller.stop(TENANT));
    assert!(h.controller.status(TENANT).run.unwrap().cancel_requested);

    let finished = h.controller.wait_finished(TENANT).await.unwrap();
    assert_eq!(finished.status, RunStatus::Cancelled);
    assert!(finished.cancel_requested);
    assert_eq!(h.counts(TENANT).await.analyzing, 0);
    assert!(h.lock.holder(TENANT).await.unwrap().is_none());
}

#[tokio::test]
async fn test_expired_lock_of_dead_process_is_taken_over() {
    let h = Harness::new().await;
    let repo = SqlxLockRepository::new(h.db.pool.clone());
    let stale = LockDbModel {
        tenant_id: TENANT,
        kind: LockKind::Stream.as_str().to_string(),
        owner_token: "crashed-process".to_string(),
        acquired_at: now_ms() - 6 * 60 * 1000,
    };
    assert!(repo.try_insert(&stale).await.unwrap());
    h.add_messages(TENANT, [1]);

    let response = h
        .controller
        .start(TENANT, Trigger::Scheduled, options(1))
        .await
        .unwrap();
    assert!(response.started, "{:?}", response.reason);

    let finished = h.controller.wait_finished(TENANT).await.unwrap();
    assert_eq!(finished.status, RunStatus::Completed);
    assert!(h.lock.holder(TENANT).await.unwrap().is_none());
}

#[tokio::test]
async fn test_live_foreign_lock_rejects_scheduled_start() {
    let h = Harness::new().await;
    let other = h.foreign_lock("other-process");
    assert!(
        other
            .acquire(TENANT, LockKind::Stream, Duration::from_millis(100))
            .await
            .unwrap()
    );

    let response = h
        .controller
        .start(TENANT, Trigger::Scheduled, options(1))
        .await
        .unwrap();
    assert!(!response.started);
    assert_eq!(response.reason.as_deref(), Some(REASON_LOCKED));
    assert!(!h.controller.is_running(TENANT));

    assert!(other.release(TENANT, LockKind::Stream).await.unwrap());
    h.run_manual(TENANT, options(1)).await;
}

#[tokio::test]
async fn test_manual_start_preempts_background_lock() {
    let h = Harness::new().await;
    let other = h.foreign_lock("background-worker");
    assert!(
        other
            .acquire(TENANT, LockKind::Auto, Duration::from_millis(100))
            .await
            .unwrap()
    );
    h.add_messages(TENANT, [1, 2]);

    let events = h.run_manual(TENANT, options(2)).await;

    assert_eq!(terminal_counters(&events).saved, 2);
    // The pre-empted owner no longer holds anything it could release.
    assert!(!other.release(TENANT, LockKind::Auto).await.unwrap());
}
