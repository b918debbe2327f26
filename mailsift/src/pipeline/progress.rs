//! Run state and the event emitter used by the driver.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::database::models::TenantId;
use crate::events::{Counters, EventBus, EventKind, ProgressEvent};

/// Lifecycle of a run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Starting,
    Fetching,
    Saving,
    Analyzing,
    Progress,
    Completed,
    Cancelled,
    Error,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Error)
    }
}

/// Snapshot of one run. Written only by the driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub tenant_id: TenantId,
    pub run_id: String,
    pub status: RunStatus,
    pub counters: Counters,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl RunState {
    pub fn new(tenant_id: TenantId, run_id: impl Into<String>) -> Self {
        Self {
            tenant_id,
            run_id: run_id.into(),
            status: RunStatus::Starting,
            counters: Counters::default(),
            started_at: Utc::now(),
            finished_at: None,
            cancel_requested: false,
            last_error: None,
        }
    }
}

/// Status a run moves to after publishing `kind`, if it changes.
fn status_after(kind: &EventKind) -> Option<RunStatus> {
    match kind {
        EventKind::Started { .. } => Some(RunStatus::Starting),
        EventKind::Stats { .. } => Some(RunStatus::Fetching),
        EventKind::Saving { .. } | EventKind::Saved { .. } => Some(RunStatus::Saving),
        EventKind::Analyzing { .. }
        | EventKind::Reanalyzing { .. }
        | EventKind::Analyzed { .. } => Some(RunStatus::Analyzing),
        EventKind::Progress { .. } => Some(RunStatus::Progress),
        EventKind::Completed { .. } => Some(RunStatus::Completed),
        EventKind::Cancelled { .. } => Some(RunStatus::Cancelled),
        EventKind::Error { fatal: true, .. } => Some(RunStatus::Error),
        _ => None,
    }
}

/// Publishes events for one run and keeps its [`RunState`] in step.
pub struct Emitter {
    tenant: TenantId,
    bus: Arc<EventBus>,
    state: watch::Sender<RunState>,
    counters: Counters,
}

impl Emitter {
    pub fn new(bus: Arc<EventBus>, state: watch::Sender<RunState>) -> Self {
        let (tenant, counters) = {
            let current = state.borrow();
            (current.tenant_id, current.counters)
        };
        Self {
            tenant,
            bus,
            state,
            counters,
        }
    }

    pub fn tenant(&self) -> TenantId {
        self.tenant
    }

    pub fn counters(&self) -> Counters {
        self.counters
    }

    pub fn update_counters(&mut self, f: impl FnOnce(&mut Counters)) {
        f(&mut self.counters);
    }

    pub fn mark_cancel_requested(&self) {
        self.state.send_modify(|s| s.cancel_requested = true);
    }

    /// Publish one event and update the run snapshot.
    pub fn emit(&self, kind: EventKind) -> ProgressEvent {
        let next_status = status_after(&kind);
        let terminal = kind.is_terminal();
        let error = match &kind {
            EventKind::Error { reason, .. } => Some(reason.clone()),
            _ => None,
        };
        let counters = self.counters;

        self.state.send_modify(|s| {
            s.counters = counters;
            if let Some(status) = next_status {
                s.status = status;
            }
            if error.is_some() {
                s.last_error = error;
            }
            if terminal {
                s.finished_at = Some(Utc::now());
            }
        });

        self.bus.publish(self.tenant, kind)
    }

    pub fn subscribe_state(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }
}
