#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use mailsift::archive::NoopArchiver;
use mailsift::database::Database;
use mailsift::database::models::{RecordCounts, RecordDbModel, TenantId};
use mailsift::database::repositories::{
    RecordRepository, SqlxCursorRepository, SqlxLockRepository, SqlxRecordRepository,
};
use mailsift::events::{Counters, EventBus, EventBusConfig, EventKind, ProgressEvent};
use mailsift::lock::{DistributedLock, LockConfig};
use mailsift::pipeline::{
    CursorStore, Emitter, IngestionPipeline, PipelineConfig, ResultSink, RunOptions, RunOutcome,
    RunState,
};
use mailsift::task::{TaskController, TaskControllerConfig, Trigger};
use mailsift::testing::{FakeAnalyzer, FakeScheduler, FakeSource};

pub const TENANT: TenantId = 1;

/// Pipeline knobs tuned so timeouts fire quickly in tests.
pub fn test_pipeline_config() -> PipelineConfig {
    PipelineConfig {
        call_timeout: Duration::from_millis(300),
        ..Default::default()
    }
}

pub fn test_lock_config() -> LockConfig {
    LockConfig {
        expiry: Duration::from_secs(300),
        retry_base_delay: Duration::from_millis(20),
        retry_max_delay: Duration::from_millis(50),
    }
}

/// One process worth of wiring over a temp database, with in-memory
/// collaborators.
pub struct Harness {
    _dir: TempDir,
    pub db: Database,
    pub source: Arc<FakeSource>,
    pub analyzer: Arc<FakeAnalyzer>,
    pub scheduler: Arc<FakeScheduler>,
    pub records: Arc<SqlxRecordRepository>,
    pub cursor: Arc<CursorStore>,
    pub pipeline: Arc<IngestionPipeline>,
    pub bus: Arc<EventBus>,
    pub lock: Arc<DistributedLock>,
    pub controller: Arc<TaskController>,
    config: PipelineConfig,
    lock_config: LockConfig,
}

/// The per-process half of the wiring: everything except the database and
/// the mailbox.
pub struct Process {
    pub analyzer: Arc<FakeAnalyzer>,
    pub scheduler: Arc<FakeScheduler>,
    pub records: Arc<SqlxRecordRepository>,
    pub cursor: Arc<CursorStore>,
    pub pipeline: Arc<IngestionPipeline>,
    pub bus: Arc<EventBus>,
    pub lock: Arc<DistributedLock>,
    pub controller: Arc<TaskController>,
}

impl Process {
    fn wire(
        db: &Database,
        source: Arc<FakeSource>,
        config: PipelineConfig,
        lock_config: LockConfig,
    ) -> Self {
        let analyzer = Arc::new(FakeAnalyzer::new());
        let scheduler = Arc::new(FakeScheduler::new());
        let records = Arc::new(SqlxRecordRepository::new(db.pool.clone()));

        let cursor = Arc::new(CursorStore::new(
            Arc::new(SqlxCursorRepository::new(db.pool.clone())),
            records.clone(),
        ));
        let sink = Arc::new(ResultSink::new(
            db.write_pool.clone(),
            records.clone(),
            scheduler.clone(),
            Arc::new(NoopArchiver),
        ));
        let pipeline = Arc::new(IngestionPipeline::new(
            source.clone(),
            analyzer.clone(),
            records.clone(),
            cursor.clone(),
            sink,
            config,
        ));

        let lock = Arc::new(DistributedLock::new(
            Arc::new(SqlxLockRepository::new(db.pool.clone())),
            lock_config,
        ));
        let bus = Arc::new(EventBus::new(EventBusConfig {
            history_capacity: 500,
            keepalive_interval: Duration::from_millis(50),
        }));
        let controller = Arc::new(TaskController::new(
            pipeline.clone(),
            lock.clone(),
            bus.clone(),
            TaskControllerConfig {
                lock_acquire_timeout: Duration::from_millis(200),
            },
        ));

        Self {
            analyzer,
            scheduler,
            records,
            cursor,
            pipeline,
            bus,
            lock,
            controller,
        }
    }
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(test_pipeline_config()).await
    }

    pub async fn with_config(config: PipelineConfig) -> Self {
        Self::build(config, test_lock_config()).await
    }

    pub async fn build(config: PipelineConfig, lock_config: LockConfig) -> Self {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("mailsift.db").display());
        let db = Database::open(&url).await.unwrap();

        let source = Arc::new(FakeSource::new());
        let process = Process::wire(&db, source.clone(), config.clone(), lock_config.clone());

        Self {
            _dir: dir,
            db,
            source,
            analyzer: process.analyzer,
            scheduler: process.scheduler,
            records: process.records,
            cursor: process.cursor,
            pipeline: process.pipeline,
            bus: process.bus,
            lock: process.lock,
            controller: process.controller,
            config,
            lock_config,
        }
    }

    /// Another process on the same database and mailbox, with its own
    /// analyzer, lock owner, bus and controller.
    pub fn second_process(&self) -> Process {
        Process::wire(
            &self.db,
            self.source.clone(),
            self.config.clone(),
            self.lock_config.clone(),
        )
    }

    /// A lock handle as another process sharing this database would hold it.
    pub fn foreign_lock(&self, owner: &str) -> DistributedLock {
        DistributedLock::with_owner(
            Arc::new(SqlxLockRepository::new(self.db.pool.clone())),
            self.lock_config.clone(),
            owner,
        )
    }

    pub fn add_messages(&self, tenant: TenantId, ids: impl IntoIterator<Item = u64>) {
        for id in ids {
            self.source.add_message(tenant, id);
        }
    }

    /// Start a manual run through the controller and wait for it to finish.
    /// Returns the events of that run.
    pub async fn run_manual(&self, tenant: TenantId, options: RunOptions) -> Vec<ProgressEvent> {
        let response = self
            .controller
            .start(tenant, Trigger::Manual, options)
            .await
            .unwrap();
        assert!(response.started, "run did not start: {:?}", response.reason);
        self.controller.wait_finished(tenant).await.unwrap();
        self.current_run_events(tenant)
    }

    /// Drive the pipeline directly with a caller-owned cancellation token.
    pub async fn run_direct(
        &self,
        tenant: TenantId,
        options: RunOptions,
        cancel: CancellationToken,
    ) -> (RunOutcome, Vec<ProgressEvent>) {
        let (state, _rx) = watch::channel(RunState::new(tenant, "direct"));
        let mut emitter = Emitter::new(self.bus.clone(), state);
        let outcome = self
            .pipeline
            .run(tenant, "direct", options, &mut emitter, cancel, None)
            .await
            .unwrap();
        (outcome, self.current_run_events(tenant))
    }

    /// History from the most recent `started` event onward.
    pub fn current_run_events(&self, tenant: TenantId) -> Vec<ProgressEvent> {
        let history = self.bus.history(tenant);
        let start = history
            .iter()
            .rposition(|e| matches!(e.kind, EventKind::Started { .. }))
            .unwrap_or(0);
        history[start..].to_vec()
    }

    pub async fn counts(&self, tenant: TenantId) -> RecordCounts {
        self.records.count_by_status(tenant).await.unwrap()
    }

    pub async fn watermark(&self, tenant: TenantId) -> u64 {
        self.cursor.get(tenant).await.unwrap()
    }

    pub async fn record_by_source_id(&self, tenant: TenantId, id: u64) -> RecordDbModel {
        sqlx::query_as::<_, RecordDbModel>(
            "SELECT * FROM records WHERE tenant_id = ? AND source_id = ?",
        )
        .bind(tenant)
        .bind(id as i64)
        .fetch_one(&self.db.pool)
        .await
        .unwrap()
    }
}

pub fn options(concurrency: usize) -> RunOptions {
    RunOptions {
        concurrency,
        ..Default::default()
    }
}

pub fn statuses(events: &[ProgressEvent]) -> Vec<&'static str> {
    events.iter().map(|e| e.kind.status()).collect()
}

pub fn ids_with_status(events: &[ProgressEvent], status: &str) -> Vec<u64> {
    events
        .iter()
        .filter(|e| e.kind.status() == status)
        .filter_map(|e| match &e.kind {
            EventKind::Saving { id }
            | EventKind::Saved { id, .. }
            | EventKind::Analyzing { id, .. }
            | EventKind::Reanalyzing { id, .. }
            | EventKind::Analyzed { id, .. }
            | EventKind::Skipped { id, .. } => Some(*id),
            EventKind::Error { id, .. } => *id,
            _ => None,
        })
        .collect()
}

/// Counters carried by the run's terminal event.
pub fn terminal_counters(events: &[ProgressEvent]) -> Counters {
    let terminal = events.last().expect("run published no events");
    match &terminal.kind {
        EventKind::Completed { counters } | EventKind::Cancelled { counters } => *counters,
        other => panic!("run ended with {other:?}"),
    }
}

pub fn assert_single_terminal(events: &[ProgressEvent]) {
    let terminals = events.iter().filter(|e| e.is_terminal()).count();
    assert_eq!(terminals, 1, "events: {:?}", statuses(events));
    assert!(events.last().is_some_and(ProgressEvent::is_terminal));
}
