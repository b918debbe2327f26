//! Bounded pool of concurrent analysis calls.
//!
//! Workers only call the analyzer and hand the outcome back; the driver
//! drains completions and does every store write itself.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::{Id, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::analysis::{AnalysisContext, AnalysisFailure, AnalysisInput, AnalysisResult, Analyzer};
use crate::database::models::{RecordId, TenantId};
use crate::utils::text::shrink_to_fraction;

pub const MIN_WORKERS: usize = 1;
pub const MAX_WORKERS: usize = 8;

/// Configuration for the analysis pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Concurrent analysis calls, clamped to 1..=8.
    pub workers: usize,
    /// Per-call timeout; expiry becomes [`AnalysisFailure::Timeout`].
    pub call_timeout: Duration,
    /// Retries with a shrunken body after [`AnalysisFailure::PayloadTooLarge`].
    pub shrink_retries: u32,
    /// Fraction of the body kept on each shrink.
    pub shrink_factor: f64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            call_timeout: Duration::from_secs(30),
            shrink_retries: 2,
            shrink_factor: 0.7,
        }
    }
}

/// One unit of analysis work.
#[derive(Debug, Clone)]
pub struct AnalysisJob {
    pub record_id: RecordId,
    pub source_id: u64,
    pub input: AnalysisInput,
}

/// What happened to a submitted job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Finished(Result<AnalysisResult, AnalysisFailure>),
    /// Cancelled before the analyzer was called.
    NotStarted,
}

#[derive(Debug, Clone)]
pub struct CompletedJob {
    pub record_id: RecordId,
    pub source_id: u64,
    pub outcome: JobOutcome,
}

/// Analysis pool for one run.
pub struct AnalysisWorkerPool {
    tenant: TenantId,
    analyzer: Arc<dyn Analyzer>,
    config: WorkerPoolConfig,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    tasks: JoinSet<JobOutcome>,
    /// Task id -> (record id, source id), so a panicked task is still attributed.
    submitted: HashMap<Id, (RecordId, u64)>,
}

impl AnalysisWorkerPool {
    pub fn new(
        tenant: TenantId,
        analyzer: Arc<dyn Analyzer>,
        mut config: WorkerPoolConfig,
        cancel: CancellationToken,
    ) -> Self {
        config.workers = config.workers.clamp(MIN_WORKERS, MAX_WORKERS);
        debug!(tenant, workers = config.workers, "analysis pool created");
        Self {
            tenant,
            analyzer,
            semaphore: Arc::new(Semaphore::new(config.workers)),
            config,
            cancel,
            tasks: JoinSet::new(),
            submitted: HashMap::new(),
        }
    }

    pub fn workers(&self) -> usize {
        self.config.workers
    }

    pub fn in_flight(&self) -> usize {
        self.submitted.len()
    }

    /// Queue a job. Never waits for a free worker.
    pub fn submit(&mut self, job: AnalysisJob) {
        let AnalysisJob {
            record_id,
            source_id,
            input,
        } = job;

        let handle = self.tasks.spawn(run_job(
            self.tenant,
            self.analyzer.clone(),
            self.semaphore.clone(),
            self.cancel.clone(),
            self.config.clone(),
            input,
        ));
        self.submitted.insert(handle.id(), (record_id, source_id));
    }

    /// Completed jobs that are ready now, without waiting.
    pub fn try_drain(&mut self) -> Vec<CompletedJob> {
        let mut done = Vec::new();
        while let Some(joined) = self.tasks.try_join_next_with_id() {
            if let Some(job) = self.complete(joined) {
                done.push(job);
            }
        }
        done
    }

    /// Wait for the next completion. `None` once nothing is in flight.
    pub async fn next_completed(&mut self) -> Option<CompletedJob> {
        loop {
            let joined = self.tasks.join_next_with_id().await?;
            if let Some(job) = self.complete(joined) {
                return Some(job);
            }
        }
    }

    fn complete(&mut self, joined: Result<(Id, JobOutcome), JoinError>) -> Option<CompletedJob> {
        let (id, outcome) = match joined {
            Ok((id, outcome)) => (id, outcome),
            Err(e) => {
                let id = e.id();
                let outcome = if e.is_panic() {
                    let message = panic_message(e.into_panic());
                    JobOutcome::Finished(Err(AnalysisFailure::Panicked(message)))
                } else {
                    JobOutcome::NotStarted
                };
                (id, outcome)
            }
        };

        let Some((record_id, source_id)) = self.submitted.remove(&id) else {
            error!(tenant = self.tenant, task_id = %id, "completed task was never submitted");
            return None;
        };

        if let JobOutcome::Finished(Err(AnalysisFailure::Panicked(message))) = &outcome {
            warn!(tenant = self.tenant, record_id, %message, "analysis worker panicked");
        }

        Some(CompletedJob {
            record_id,
            source_id,
            outcome,
        })
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn run_job(
    tenant: TenantId,
    analyzer: Arc<dyn Analyzer>,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    config: WorkerPoolConfig,
    mut input: AnalysisInput,
) -> JobOutcome {
    let Ok(_permit) = semaphore.acquire_owned().await else {
        return JobOutcome::NotStarted;
    };
    // Queued work does not start once the run is cancelled; started work finishes.
    if cancel.is_cancelled() {
        return JobOutcome::NotStarted;
    }

    let mut shrinks = 0u32;
    loop {
        let ctx = AnalysisContext {
            tenant,
            reference_time: Utc::now(),
        };
        let result = match tokio::time::timeout(config.call_timeout, analyzer.analyze(&input, &ctx))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(AnalysisFailure::Timeout),
        };

        match result {
            Err(AnalysisFailure::PayloadTooLarge) if shrinks < config.shrink_retries => {
                let Some(body) = shrink_to_fraction(&input.body, config.shrink_factor) else {
                    return JobOutcome::Finished(Err(AnalysisFailure::PayloadTooLarge));
                };
                shrinks += 1;
                debug!(tenant, shrinks, len = body.len(), "payload too large, retrying shrunk");
                input.body = body;
            }
            other => return JobOutcome::Finished(other),
        }
    }
}
