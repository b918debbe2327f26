//! Per-tenant run control.
//!
//! [`TaskController`] owns every run in this process: it takes the tenant
//! lock, spawns one driver task per run, relays cancellation and answers
//! status queries. The driver is the only writer of a run's [`RunState`];
//! the controller only reads snapshots from its watch channel.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::database::models::TenantId;
use crate::events::{EventBus, EventKind, EventStream, ProgressEvent};
use crate::lock::{DistributedLock, LockKind};
use crate::pipeline::{Emitter, IngestionPipeline, RunOptions, RunState, RunStatus};

/// Reason returned when the tenant already has a run in this process.
pub const REASON_ALREADY_RUNNING: &str = "already running";
/// Reason returned when another process holds the tenant lock.
pub const REASON_LOCKED: &str = "locked by another process";

/// Who asked for the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    /// API request. Pre-empts a background run held by another process.
    Manual,
    /// Background auto-sync.
    Scheduled,
}

impl Trigger {
    pub fn lock_kind(&self) -> LockKind {
        match self {
            Self::Manual => LockKind::Stream,
            Self::Scheduled => LockKind::Auto,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskControllerConfig {
    /// How long `start` waits for the tenant lock.
    pub lock_acquire_timeout: Duration,
}

impl Default for TaskControllerConfig {
    fn default() -> Self {
        Self {
            lock_acquire_timeout: Duration::from_secs(10),
        }
    }
}

/// Answer to a start request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartResponse {
    pub started: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    /// Status of the run that is now active, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
}

impl StartResponse {
    fn rejected(reason: &str, status: Option<RunStatus>) -> Self {
        Self {
            started: false,
            reason: Some(reason.to_string()),
            run_id: None,
            status,
        }
    }
}

/// Point-in-time view of a tenant's run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// A run is in progress.
    pub active: bool,
    /// Current run, or the most recent finished one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<RunState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event: Option<ProgressEvent>,
}

struct RunSlot {
    run_id: String,
    cancel: CancellationToken,
    state: watch::Receiver<RunState>,
    done: watch::Receiver<bool>,
}

impl RunSlot {
    fn is_active(&self) -> bool {
        !*self.done.borrow()
    }

    fn snapshot(&self) -> RunState {
        let mut state = self.state.borrow().clone();
        if self.cancel.is_cancelled() {
            state.cancel_requested = true;
        }
        state
    }
}

/// Everything a driver task needs, moved into it at spawn.
struct DriverArgs {
    tenant: TenantId,
    run_id: String,
    kind: LockKind,
    options: RunOptions,
    state: watch::Sender<RunState>,
    cancel: CancellationToken,
    done: watch::Sender<bool>,
}

pub struct TaskController {
    pipeline: Arc<IngestionPipeline>,
    lock: Arc<DistributedLock>,
    bus: Arc<EventBus>,
    config: TaskControllerConfig,
    /// Per-tenant start gates, so two callers cannot both pass the
    /// "already running" check while other tenants start freely.
    start_gates: Mutex<HashMap<TenantId, Arc<tokio::sync::Mutex<()>>>>,
    runs: Mutex<HashMap<TenantId, RunSlot>>,
    shutdown: CancellationToken,
}

impl TaskController {
    pub fn new(
        pipeline: Arc<IngestionPipeline>,
        lock: Arc<DistributedLock>,
        bus: Arc<EventBus>,
        config: TaskControllerConfig,
    ) -> Self {
        Self {
            pipeline,
            lock,
            bus,
            config,
            start_gates: Mutex::new(HashMap::new()),
            runs: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn lock(&self) -> &Arc<DistributedLock> {
        &self.lock
    }

    fn active_status(&self, tenant: TenantId) -> Option<RunStatus> {
        self.runs
            .lock()
            .get(&tenant)
            .filter(|slot| slot.is_active())
            .map(|slot| slot.state.borrow().status)
    }

    pub fn is_running(&self, tenant: TenantId) -> bool {
        self.active_status(tenant).is_some()
    }

    /// Start a run for `tenant`.
    ///
    /// Returns `started: false` with a reason when a run is already active
    /// here or the tenant lock stays held elsewhere. Store errors while
    /// taking the lock are returned as errors.
    pub async fn start(
        self: &Arc<Self>,
        tenant: TenantId,
        trigger: Trigger,
        options: RunOptions,
    ) -> Result<StartResponse> {
        let gate = self.start_gates.lock().entry(tenant).or_default().clone();
        let _gate = gate.lock().await;

        if let Some(status) = self.active_status(tenant) {
            debug!(tenant, %trigger, "start rejected, run already active");
            return Ok(StartResponse::rejected(REASON_ALREADY_RUNNING, Some(status)));
        }
        if self.shutdown.is_cancelled() {
            return Ok(StartResponse::rejected("shutting down", None));
        }

        let kind = trigger.lock_kind();
        if trigger == Trigger::Manual
            && let Some(holder) = self.lock.holder(tenant).await?
            && holder.kind == LockKind::Auto.as_str()
        {
            info!(
                tenant,
                previous_owner = %holder.owner_token,
                "manual start pre-empts background run"
            );
            self.lock.force_release_all(tenant).await?;
        }

        if !self
            .lock
            .acquire(tenant, kind, self.config.lock_acquire_timeout)
            .await?
        {
            info!(tenant, %trigger, "start rejected, tenant locked elsewhere");
            return Ok(StartResponse::rejected(REASON_LOCKED, None));
        }

        let run_id = uuid::Uuid::new_v4().to_string();
        let (state_tx, state_rx) = watch::channel(RunState::new(tenant, run_id.clone()));
        let (done_tx, done_rx) = watch::channel(false);
        let cancel = self.shutdown.child_token();

        self.bus.open_run(tenant);
        self.runs.lock().insert(
            tenant,
            RunSlot {
                run_id: run_id.clone(),
                cancel: cancel.clone(),
                state: state_rx,
                done: done_rx,
            },
        );

        info!(tenant, run_id = %run_id, %trigger, "run starting");
        let controller = self.clone();
        tokio::spawn(controller.drive(DriverArgs {
            tenant,
            run_id: run_id.clone(),
            kind,
            options,
            state: state_tx,
            cancel,
            done: done_tx,
        }));

        Ok(StartResponse {
            started: true,
            reason: None,
            run_id: Some(run_id),
            status: Some(RunStatus::Starting),
        })
    }

    async fn drive(self: Arc<Self>, args: DriverArgs) {
        let DriverArgs {
            tenant,
            run_id,
            kind,
            options,
            state,
            cancel,
            done,
        } = args;

        let lease = self.lock.lease(tenant, kind);
        let heartbeat_stop = CancellationToken::new();
        let heartbeat = lease.spawn_heartbeat(heartbeat_stop.clone());

        let mut emitter = Emitter::new(self.bus.clone(), state);
        let run = AssertUnwindSafe(self.pipeline.run(
            tenant,
            &run_id,
            options,
            &mut emitter,
            cancel,
            Some(&lease),
        ))
        .catch_unwind()
        .await;

        match run {
            Ok(Ok(outcome)) => debug!(tenant, run_id = %run_id, ?outcome, "driver finished"),
            Ok(Err(e)) => warn!(tenant, run_id = %run_id, error = %e, "run ended with error"),
            Err(_) => {
                error!(tenant, run_id = %run_id, "run driver panicked");
                emitter.emit(EventKind::Error {
                    id: None,
                    record_id: None,
                    reason: "run driver panicked".to_string(),
                    fatal: true,
                });
            }
        }

        heartbeat_stop.cancel();
        if let Err(e) = heartbeat.await {
            warn!(tenant, error = %e, "lock heartbeat task failed");
        }
        if lease.is_lost() {
            info!(tenant, run_id = %run_id, "run pre-empted, lock now held elsewhere");
        } else if let Err(e) = self.lock.release(tenant, kind).await {
            error!(tenant, run_id = %run_id, error = %e, "failed to release lock");
        }
        self.bus.close_run(tenant);
        done.send_replace(true);
        info!(tenant, run_id = %run_id, "run finished");
    }

    /// Ask the tenant's run to stop at its next checkpoint.
    ///
    /// Returns whether an active run was signalled.
    pub fn stop(&self, tenant: TenantId) -> bool {
        let runs = self.runs.lock();
        match runs.get(&tenant).filter(|slot| slot.is_active()) {
            Some(slot) => {
                info!(tenant, run_id = %slot.run_id, "cancellation requested");
                slot.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn status(&self, tenant: TenantId) -> StatusSnapshot {
        let (active, run) = match self.runs.lock().get(&tenant) {
            Some(slot) => (slot.is_active(), Some(slot.snapshot())),
            None => (false, None),
        };
        StatusSnapshot {
            active,
            run,
            last_event: self.bus.last_event(tenant),
        }
    }

    /// Live events for `tenant`, replaying the current run first.
    pub fn subscribe(&self, tenant: TenantId) -> EventStream {
        self.bus.subscribe(tenant)
    }

    /// Wait until the tenant's current run has released its lock.
    ///
    /// Returns the final state, or `None` if the tenant never ran here.
    pub async fn wait_finished(&self, tenant: TenantId) -> Option<RunState> {
        let mut done = self.runs.lock().get(&tenant).map(|slot| slot.done.clone())?;
        // The sender is dropped only after it sent `true`.
        let _ = done.wait_for(|finished| *finished).await;
        self.runs.lock().get(&tenant).map(RunSlot::snapshot)
    }

    /// Cancel every active run and wait for all of them to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let pending: Vec<(TenantId, watch::Receiver<bool>)> = self
            .runs
            .lock()
            .iter()
            .filter(|(_, slot)| slot.is_active())
            .map(|(tenant, slot)| (*tenant, slot.done.clone()))
            .collect();

        for (tenant, mut done) in pending {
            debug!(tenant, "waiting for run to stop");
            let _ = done.wait_for(|finished| *finished).await;
        }
        info!("task controller stopped");
    }
}
