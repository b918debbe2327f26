//! Background auto-sync.
//!
//! Periodically starts a scheduled run for every tenant whose sync interval
//! has elapsed, waits for it, then dispatches due reminders.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::database::models::TenantDbModel;
use crate::database::repositories::TenantRepository;
use crate::database::time::now_ms;
use crate::notification::ReminderDispatcher;
use crate::pipeline::{RunOptions, RunStatus};
use crate::task::{TaskController, Trigger};

/// Consecutive failed iterations tolerated before the sleep starts doubling.
const FAILURES_BEFORE_BACKOFF: u32 = 5;

#[derive(Debug, Clone)]
pub struct AutoSyncConfig {
    /// Sleep between iterations.
    pub interval: Duration,
    /// Upper bound of the failure backoff.
    pub max_backoff: Duration,
    pub max_items: usize,
    pub lookback: Duration,
    pub concurrency: usize,
}

impl Default for AutoSyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1800),
            max_backoff: Duration::from_secs(4 * 3600),
            max_items: 50,
            lookback: Duration::from_secs(24 * 3600),
            concurrency: 3,
        }
    }
}

/// Tally of one iteration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IterationSummary {
    pub tenants: usize,
    pub synced: usize,
    /// Not due yet, or a run was already active.
    pub skipped: usize,
    pub failed: usize,
}

pub struct AutoSyncWorker {
    controller: Arc<TaskController>,
    tenants: Arc<dyn TenantRepository>,
    dispatcher: Arc<ReminderDispatcher>,
    config: AutoSyncConfig,
}

impl AutoSyncWorker {
    pub fn new(
        controller: Arc<TaskController>,
        tenants: Arc<dyn TenantRepository>,
        dispatcher: Arc<ReminderDispatcher>,
        config: AutoSyncConfig,
    ) -> Self {
        Self {
            controller,
            tenants,
            dispatcher,
            config,
        }
    }

    fn is_due(tenant: &TenantDbModel, now: i64) -> bool {
        match tenant.last_sync_at {
            Some(last) => now - last >= tenant.sync_interval_secs.saturating_mul(1000),
            None => true,
        }
    }

    fn run_options(&self) -> RunOptions {
        RunOptions {
            max_items: Some(self.config.max_items),
            concurrency: self.config.concurrency,
            lookback: self.config.lookback,
        }
    }

    /// One pass over all auto-sync tenants.
    ///
    /// Only a failure to list tenants fails the iteration; per-tenant
    /// problems are logged and counted.
    pub async fn run_once(&self) -> Result<IterationSummary> {
        let tenants = self.tenants.list_auto_sync().await?;
        let mut summary = IterationSummary {
            tenants: tenants.len(),
            ..Default::default()
        };

        for tenant in tenants {
            if !Self::is_due(&tenant, now_ms()) {
                summary.skipped += 1;
                continue;
            }

            let response = match self
                .controller
                .start(tenant.id, Trigger::Scheduled, self.run_options())
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    warn!(tenant = tenant.id, error = %e, "auto-sync start failed");
                    summary.failed += 1;
                    continue;
                }
            };
            if !response.started {
                debug!(tenant = tenant.id, reason = ?response.reason, "auto-sync skipped");
                summary.skipped += 1;
                continue;
            }

            let final_state = self.controller.wait_finished(tenant.id).await;
            if final_state.is_some_and(|s| s.status == RunStatus::Error) {
                summary.failed += 1;
            } else {
                summary.synced += 1;
            }

            if let Err(e) = self.dispatcher.dispatch_due(tenant.id, Utc::now()).await {
                warn!(tenant = tenant.id, error = %e, "reminder dispatch failed");
            }
            if let Err(e) = self.tenants.touch_last_sync(tenant.id, now_ms()).await {
                warn!(tenant = tenant.id, error = %e, "failed to stamp last sync");
            }
        }

        Ok(summary)
    }

    /// Sleep before the next iteration after `failures` consecutive failures.
    fn next_delay(&self, failures: u32) -> Duration {
        if failures < FAILURES_BEFORE_BACKOFF {
            return self.config.interval;
        }
        let doublings = (failures - FAILURES_BEFORE_BACKOFF + 1).min(16);
        self.config
            .interval
            .saturating_mul(1u32 << doublings)
            .min(self.config.max_backoff.max(self.config.interval))
    }

    /// Run until `cancel` fires.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_secs = self.config.interval.as_secs(), "auto-sync worker started");
            let mut failures = 0u32;
            loop {
                match self.run_once().await {
                    Ok(summary) => {
                        failures = 0;
                        if summary.synced > 0 || summary.failed > 0 {
                            info!(?summary, "auto-sync iteration finished");
                        }
                    }
                    Err(e) => {
                        failures += 1;
                        error!(failures, error = %e, "auto-sync iteration failed");
                    }
                }

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.next_delay(failures)) => {}
                }
            }
            info!("auto-sync worker stopped");
        })
    }
}
