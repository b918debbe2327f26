//! In-process event bus with replay and keep-alive.
//!
//! Each tenant gets a monotonic sequence counter, a bounded history ring and a
//! broadcast channel for live delivery. Publishing never waits on subscribers:
//! a subscriber that falls behind the broadcast buffer is backfilled from the
//! history ring instead.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, trace};

use super::kind::{EventKind, ProgressEvent};
use crate::database::models::TenantId;

/// Stream of events delivered to one subscriber.
pub type EventStream = BoxStream<'static, ProgressEvent>;

#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Events retained per tenant for replay.
    pub history_capacity: usize,
    /// Idle interval after which a subscriber receives a `keepalive`.
    pub keepalive_interval: Duration,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            history_capacity: 500,
            keepalive_interval: Duration::from_secs(15),
        }
    }
}

struct TenantChannel {
    last_seq: u64,
    history: VecDeque<Arc<ProgressEvent>>,
    sender: broadcast::Sender<Arc<ProgressEvent>>,
    /// A run is currently publishing for this tenant.
    active: bool,
    /// `last_seq` when the active run was opened.
    run_floor: u64,
}

impl TenantChannel {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            last_seq: 0,
            history: VecDeque::with_capacity(capacity),
            sender,
            active: false,
            run_floor: 0,
        }
    }

    /// History from the most recent `started` event onward. While a run is
    /// open, events of earlier runs are never replayed.
    fn current_run(&self) -> VecDeque<Arc<ProgressEvent>> {
        let start = self
            .history
            .iter()
            .rposition(|e| matches!(e.kind, EventKind::Started { .. }))
            .unwrap_or(0);
        self.history
            .iter()
            .skip(start)
            .filter(|e| !self.active || e.seq > self.run_floor)
            .cloned()
            .collect()
    }
}

/// Per-tenant publish / replay / subscribe hub.
pub struct EventBus {
    config: EventBusConfig,
    channels: Mutex<HashMap<TenantId, TenantChannel>>,
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Self {
        Self {
            config,
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &EventBusConfig {
        &self.config
    }

    /// Assign the next sequence number, record the event and fan it out.
    pub fn publish(&self, tenant: TenantId, kind: EventKind) -> ProgressEvent {
        let capacity = self.config.history_capacity.max(1);
        let mut channels = self.channels.lock();
        let channel = channels
            .entry(tenant)
            .or_insert_with(|| TenantChannel::new(capacity));

        channel.last_seq += 1;
        let event = Arc::new(ProgressEvent {
            seq: channel.last_seq,
            ts: Utc::now(),
            kind,
        });

        if channel.history.len() >= capacity {
            channel.history.pop_front();
        }
        channel.history.push_back(event.clone());

        // Err only means there are no live receivers right now.
        let receivers = channel.sender.send(event.clone()).unwrap_or(0);
        trace!(
            tenant,
            seq = event.seq,
            status = event.kind.status(),
            receivers,
            "published event"
        );

        (*event).clone()
    }

    /// Mark a run as publishing. Subscribers wait on active tenants instead of
    /// ending when idle.
    pub fn open_run(&self, tenant: TenantId) {
        let capacity = self.config.history_capacity.max(1);
        let mut channels = self.channels.lock();
        let channel = channels
            .entry(tenant)
            .or_insert_with(|| TenantChannel::new(capacity));
        channel.active = true;
        channel.run_floor = channel.last_seq;
    }

    pub fn close_run(&self, tenant: TenantId) {
        if let Some(channel) = self.channels.lock().get_mut(&tenant) {
            channel.active = false;
        }
    }

    pub fn is_active(&self, tenant: TenantId) -> bool {
        self.channels
            .lock()
            .get(&tenant)
            .is_some_and(|c| c.active)
    }

    /// Snapshot of the retained history, oldest first.
    pub fn history(&self, tenant: TenantId) -> Vec<ProgressEvent> {
        self.channels
            .lock()
            .get(&tenant)
            .map(|c| c.history.iter().map(|e| (**e).clone()).collect())
            .unwrap_or_default()
    }

    pub fn last_event(&self, tenant: TenantId) -> Option<ProgressEvent> {
        self.channels
            .lock()
            .get(&tenant)
            .and_then(|c| c.history.back().map(|e| (**e).clone()))
    }

    fn history_after(&self, tenant: TenantId, seq: u64) -> VecDeque<Arc<ProgressEvent>> {
        self.channels
            .lock()
            .get(&tenant)
            .map(|c| c.history.iter().filter(|e| e.seq > seq).cloned().collect())
            .unwrap_or_default()
    }

    /// Subscribe to a tenant's events.
    ///
    /// Replays the current run's retained history, then follows live events.
    /// Idle periods yield synthetic `keepalive` events. The stream ends after
    /// the first terminal event, or on an idle tick while no run is active.
    pub fn subscribe(self: &Arc<Self>, tenant: TenantId) -> EventStream {
        let capacity = self.config.history_capacity.max(1);
        let (replay, receiver) = {
            let mut channels = self.channels.lock();
            let channel = channels
                .entry(tenant)
                .or_insert_with(|| TenantChannel::new(capacity));
            // Snapshot and receiver are taken under the same lock so no
            // event can slip between them.
            (channel.current_run(), channel.sender.subscribe())
        };

        debug!(tenant, replay = replay.len(), "subscriber attached");

        let state = Subscription {
            bus: self.clone(),
            tenant,
            replay,
            receiver,
            last_seq: 0,
            done: false,
        };

        stream::unfold(state, |mut state| async move {
            let event = state.next_event().await?;
            Some((event, state))
        })
        .boxed()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EventBusConfig::default())
    }
}

struct Subscription {
    bus: Arc<EventBus>,
    tenant: TenantId,
    replay: VecDeque<Arc<ProgressEvent>>,
    receiver: broadcast::Receiver<Arc<ProgressEvent>>,
    last_seq: u64,
    done: bool,
}

impl Subscription {
    /// Deliver `event` unless it was already seen.
    fn accept(&mut self, event: Arc<ProgressEvent>) -> Option<ProgressEvent> {
        if event.seq <= self.last_seq {
            return None;
        }
        self.last_seq = event.seq;
        if event.is_terminal() {
            self.done = true;
        }
        Some((*event).clone())
    }

    async fn next_event(&mut self) -> Option<ProgressEvent> {
        let keepalive = self.bus.config.keepalive_interval;
        loop {
            if self.done {
                return None;
            }

            if let Some(event) = self.replay.pop_front() {
                if let Some(event) = self.accept(event) {
                    return Some(event);
                }
                continue;
            }

            match tokio::time::timeout(keepalive, self.receiver.recv()).await {
                Ok(Ok(event)) => {
                    if let Some(event) = self.accept(event) {
                        return Some(event);
                    }
                }
                Ok(Err(RecvError::Lagged(skipped))) => {
                    debug!(tenant = self.tenant, skipped, "subscriber lagged, backfilling");
                    self.replay = self.bus.history_after(self.tenant, self.last_seq);
                }
                Ok(Err(RecvError::Closed)) => return None,
                Err(_) => {
                    if !self.bus.is_active(self.tenant) {
                        return None;
                    }
                    return Some(ProgressEvent {
                        seq: self.last_seq,
                        ts: Utc::now(),
                        kind: EventKind::Keepalive {},
                    });
                }
            }
        }
    }
}
