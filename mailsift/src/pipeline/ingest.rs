//! The ingestion driver.
//!
//! One call to [`IngestionPipeline::run`] is one run for one tenant. The
//! driver lists candidates above the watermark, stores new records, feeds the
//! analysis pool without waiting on it, and writes every completion back
//! itself. Every state change is published through the [`Emitter`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::cursor::CursorStore;
use super::progress::Emitter;
use super::result_sink::ResultSink;
use super::worker_pool::{AnalysisJob, AnalysisWorkerPool, CompletedJob, JobOutcome, WorkerPoolConfig};
use crate::Result;
use crate::analysis::{AnalysisFailure, AnalysisInput, Analyzer};
use crate::database::models::{NewRecord, RecordDbModel, RecordId, RecordStatus, TenantId};
use crate::database::repositories::RecordRepository;
use crate::database::time::{datetime_to_ms, ms_to_datetime};
use crate::events::{Counters, EventKind};
use crate::lock::LockLease;
use crate::source::{MessageHeader, MessageSource, SourceError};
use crate::utils::text::preview;

/// Per-run options.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Keep only the newest N candidates.
    pub max_items: Option<usize>,
    /// Analysis workers, clamped to 1..=8.
    pub concurrency: usize,
    /// Window used when the tenant has no watermark yet.
    pub lookback: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_items: None,
            concurrency: 3,
            lookback: Duration::from_secs(24 * 3600),
        }
    }
}

/// Knobs that do not change per run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub call_timeout: Duration,
    pub shrink_retries: u32,
    pub shrink_factor: f64,
    /// Max backlog records loaded at run start.
    pub backlog_limit: i64,
    /// Emit `progress` every N candidates.
    pub progress_every: usize,
    /// Emit the 1st `skipped` and then every Nth.
    pub skip_sample_every: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            shrink_retries: 2,
            shrink_factor: 0.7,
            backlog_limit: 500,
            progress_every: 10,
            skip_sample_every: 25,
        }
    }
}

/// How a run ended, when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed(Counters),
    Cancelled(Counters),
}

/// Stable per-tenant identity of a message.
///
/// Uses the source's message id when present; otherwise a synthetic key
/// hashed from tenant and source id.
pub fn identity_key(tenant: TenantId, header: &MessageHeader) -> String {
    match header.message_id.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => {
            let mut hasher = Sha256::new();
            hasher.update(format!("{tenant}:{}", header.id).as_bytes());
            format!("synthetic:{}", hex::encode(hasher.finalize()))
        }
    }
}

fn analysis_input(record: &RecordDbModel) -> AnalysisInput {
    AnalysisInput {
        subject: record.subject.clone(),
        body: record.body.clone(),
        received_at: record.received_at.map(ms_to_datetime),
    }
}

/// Mutable state of one run, owned by the driver.
struct RunContext<'a> {
    tenant: TenantId,
    emitter: &'a mut Emitter,
    lease: Option<&'a LockLease>,
    pool: AnalysisWorkerPool,
    /// Records currently queued or running in the pool.
    in_flight: HashSet<RecordId>,
    /// Lowest candidate whose fetch failed transiently.
    first_fetch_failure: Option<u64>,
}

pub struct IngestionPipeline {
    source: Arc<dyn MessageSource>,
    analyzer: Arc<dyn Analyzer>,
    records: Arc<dyn RecordRepository>,
    cursor: Arc<CursorStore>,
    sink: Arc<ResultSink>,
    config: PipelineConfig,
}

/// Fails once the tenant lock is no longer ours. Runs without a lease
/// (driven directly, outside the controller) always pass.
async fn ensure_lease(lease: Option<&LockLease>) -> Result<()> {
    match lease {
        Some(lease) => lease.ensure_held().await,
        None => Ok(()),
    }
}

impl IngestionPipeline {
    pub fn new(
        source: Arc<dyn MessageSource>,
        analyzer: Arc<dyn Analyzer>,
        records: Arc<dyn RecordRepository>,
        cursor: Arc<CursorStore>,
        sink: Arc<ResultSink>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            source,
            analyzer,
            records,
            cursor,
            sink,
            config,
        }
    }

    pub fn cursor(&self) -> &CursorStore {
        &self.cursor
    }

    /// Execute one run. Publishes exactly one terminal event.
    ///
    /// Store failures and a lost `lease` abort the run with a fatal `error`
    /// event and are returned; releasing the tenant lock is the caller's job.
    pub async fn run(
        &self,
        tenant: TenantId,
        run_id: &str,
        options: RunOptions,
        emitter: &mut Emitter,
        cancel: CancellationToken,
        lease: Option<&LockLease>,
    ) -> Result<RunOutcome> {
        match self
            .execute(tenant, run_id, &options, emitter, &cancel, lease)
            .await
        {
            Ok(outcome) => {
                match outcome {
                    RunOutcome::Completed(counters) => {
                        info!(tenant, run_id, ?counters, "run completed");
                        emitter.emit(EventKind::Completed { counters });
                    }
                    RunOutcome::Cancelled(counters) => {
                        info!(tenant, run_id, ?counters, "run cancelled");
                        emitter.mark_cancel_requested();
                        emitter.emit(EventKind::Cancelled { counters });
                    }
                }
                Ok(outcome)
            }
            Err(e) => {
                error!(tenant, run_id, error = %e, "run aborted");
                emitter.emit(EventKind::Error {
                    id: None,
                    record_id: None,
                    reason: e.to_string(),
                    fatal: true,
                });
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        tenant: TenantId,
        run_id: &str,
        options: &RunOptions,
        emitter: &mut Emitter,
        cancel: &CancellationToken,
        lease: Option<&LockLease>,
    ) -> Result<RunOutcome> {
        emitter.emit(EventKind::Started {
            run_id: run_id.to_string(),
            message: format!("sync started for tenant {tenant}"),
        });

        let reset = self.records.reset_stale_analyzing(tenant).await?;
        if reset > 0 {
            warn!(tenant, reset, "reset records left in analyzing");
            emitter.emit(EventKind::Info {
                message: format!("recovered {reset} interrupted analyses"),
            });
        }

        let plan = self
            .cursor
            .plan(tenant, self.source.as_ref(), options.lookback)
            .await?;
        if let Some(e) = &plan.listing_error {
            warn!(tenant, error = %e, "candidate listing failed, continuing with backlog");
            emitter.emit(EventKind::Error {
                id: None,
                record_id: None,
                reason: format!("listing failed: {e}"),
                fatal: false,
            });
        }

        let mut candidates = plan.candidates;
        if let Some(max) = options.max_items
            && candidates.len() > max
        {
            candidates = candidates.split_off(candidates.len() - max);
        }

        let backlog = self
            .records
            .list_backlog(tenant, self.config.backlog_limit)
            .await?;

        emitter.emit(EventKind::Stats {
            candidates: candidates.len() as u64,
            backlog: backlog.len() as u64,
            watermark: plan.watermark,
        });
        debug!(tenant, mode = ?plan.mode, candidates = candidates.len(), backlog = backlog.len(), "run planned");

        let pool = AnalysisWorkerPool::new(
            tenant,
            self.analyzer.clone(),
            WorkerPoolConfig {
                workers: options.concurrency,
                call_timeout: self.config.call_timeout,
                shrink_retries: self.config.shrink_retries,
                shrink_factor: self.config.shrink_factor,
            },
            cancel.clone(),
        );
        let mut ctx = RunContext {
            tenant,
            emitter,
            lease,
            pool,
            in_flight: HashSet::new(),
            first_fetch_failure: None,
        };

        for record in &backlog {
            self.submit(&mut ctx, record, true).await?;
        }

        let total = candidates.len() as u64;
        let mut max_seen: Option<u64> = None;
        let mut cancelled = false;

        for (idx, id) in candidates.iter().copied().enumerate() {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            ensure_lease(ctx.lease).await?;

            for done in ctx.pool.try_drain() {
                self.handle_completed(&mut ctx, done).await?;
            }

            ctx.emitter.update_counters(|c| c.scanned += 1);
            max_seen = Some(id);
            self.process_candidate(&mut ctx, id).await?;

            let processed = idx + 1;
            if processed % self.config.progress_every.max(1) == 0 {
                let counters = ctx.emitter.counters();
                ctx.emitter.emit(EventKind::Progress {
                    processed: processed as u64,
                    total,
                    counters,
                });
            }
        }

        loop {
            let next = match ctx.lease {
                Some(lease) => tokio::select! {
                    next = ctx.pool.next_completed() => next,
                    // Dropping the pool aborts analyses still in flight.
                    _ = lease.lost() => return Err(crate::Error::LockLost { tenant }),
                },
                None => ctx.pool.next_completed().await,
            };
            let Some(done) = next else { break };
            self.handle_completed(&mut ctx, done).await?;
        }

        let cancelled = cancelled || cancel.is_cancelled();
        let counters = ctx.emitter.counters();
        if cancelled {
            return Ok(RunOutcome::Cancelled(counters));
        }

        if plan.listing_error.is_none()
            && let Some(max) = max_seen
        {
            let target = match ctx.first_fetch_failure {
                Some(failed) => max.min(failed.saturating_sub(1)),
                None => max,
            };
            if target > plan.watermark {
                ensure_lease(ctx.lease).await?;
                self.cursor.advance(tenant, target).await?;
            }
        }

        Ok(RunOutcome::Completed(counters))
    }

    async fn process_candidate(&self, ctx: &mut RunContext<'_>, id: u64) -> Result<()> {
        let tenant = ctx.tenant;

        let header = match self.source.fetch_header(tenant, id).await {
            Ok(header) => header,
            Err(e) => {
                self.fetch_failed(ctx, id, "header", &e);
                return Ok(());
            }
        };
        let key = identity_key(tenant, &header);

        if let Some(existing) = self.records.find_by_identity(tenant, &key).await? {
            if existing.status() == RecordStatus::Analyzed {
                ctx.emitter.update_counters(|c| c.skipped += 1);
                let skipped = ctx.emitter.counters().skipped;
                if skipped == 1 || skipped % self.config.skip_sample_every.max(1) == 0 {
                    ctx.emitter.emit(EventKind::Skipped { id, skipped });
                }
            } else {
                self.submit(ctx, &existing, true).await?;
            }
            return Ok(());
        }

        ctx.emitter.emit(EventKind::Saving { id });
        let payload = match self.source.fetch_full(tenant, id).await {
            Ok(payload) => payload,
            Err(e) => {
                self.fetch_failed(ctx, id, "payload", &e);
                return Ok(());
            }
        };

        let new_record = NewRecord {
            tenant_id: tenant,
            identity_key: key,
            source_id: i64::try_from(id).unwrap_or(i64::MAX),
            subject: payload.header.subject,
            sender: payload.header.sender,
            body: payload.body,
            html_body: payload.html_body,
            received_at: payload.header.received_at.map(datetime_to_ms),
        };
        let inserted = self.records.insert_record(&new_record).await?;
        let record = inserted.record();

        if inserted.is_inserted() {
            ctx.emitter.update_counters(|c| c.saved += 1);
            ctx.emitter.emit(EventKind::Saved {
                id,
                record_id: record.id,
                subject: preview(&record.subject, 120),
            });
            self.submit(ctx, record, false).await
        } else {
            // Lost an insert race to another writer; treat it like a known record.
            debug!(tenant, id, record_id = record.id, "record already stored");
            if record.status().needs_analysis() {
                self.submit(ctx, record, true).await?;
            }
            Ok(())
        }
    }

    fn fetch_failed(&self, ctx: &mut RunContext<'_>, id: u64, what: &str, e: &SourceError) {
        warn!(tenant = ctx.tenant, id, error = %e, "failed to fetch {what}");
        if matches!(e, SourceError::Transient(_)) {
            ctx.first_fetch_failure = Some(ctx.first_fetch_failure.map_or(id, |f| f.min(id)));
        }
        ctx.emitter.emit(EventKind::Error {
            id: Some(id),
            record_id: None,
            reason: format!("fetch {what} failed: {e}"),
            fatal: false,
        });
    }

    /// Hand a record to the pool if it is not already queued.
    async fn submit(
        &self,
        ctx: &mut RunContext<'_>,
        record: &RecordDbModel,
        existing: bool,
    ) -> Result<()> {
        if ctx.in_flight.contains(&record.id) || !self.records.mark_analyzing(record.id).await? {
            return Ok(());
        }

        let source_id = record.source_id.max(0) as u64;
        ctx.in_flight.insert(record.id);
        ctx.pool.submit(AnalysisJob {
            record_id: record.id,
            source_id,
            input: analysis_input(record),
        });

        let kind = if existing {
            EventKind::Reanalyzing {
                record_id: record.id,
                id: source_id,
            }
        } else {
            EventKind::Analyzing {
                record_id: record.id,
                id: source_id,
            }
        };
        ctx.emitter.emit(kind);
        Ok(())
    }

    async fn handle_completed(&self, ctx: &mut RunContext<'_>, done: CompletedJob) -> Result<()> {
        let CompletedJob {
            record_id,
            source_id,
            outcome,
        } = done;
        ctx.in_flight.remove(&record_id);
        ensure_lease(ctx.lease).await?;

        match outcome {
            JobOutcome::NotStarted => {
                self.sink.release_unstarted(record_id).await?;
                debug!(tenant = ctx.tenant, record_id, "queued analysis dropped by cancellation");
            }
            JobOutcome::Finished(Ok(result)) => {
                match self.sink.apply_success(ctx.tenant, record_id, &result).await {
                    Ok(applied) => {
                        ctx.emitter.update_counters(|c| c.analyzed += 1);
                        ctx.emitter.emit(EventKind::Analyzed {
                            record_id,
                            id: source_id,
                            summary: preview(&result.summary, 200),
                            entries: applied.entries_created,
                        });
                    }
                    Err(e) if !e.is_fatal() => {
                        warn!(tenant = ctx.tenant, record_id, error = %e, "result could not be stored");
                        let failure = AnalysisFailure::Malformed(format!("result not stored: {e}"));
                        self.record_failure(ctx, record_id, source_id, &failure).await?;
                    }
                    Err(e) => return Err(e),
                }
            }
            JobOutcome::Finished(Err(failure)) => {
                warn!(tenant = ctx.tenant, record_id, source_id, error = %failure, "analysis failed");
                self.record_failure(ctx, record_id, source_id, &failure).await?;
            }
        }
        Ok(())
    }

    /// Mark the record `failed` so it leaves `analyzing`, and report it.
    async fn record_failure(
        &self,
        ctx: &mut RunContext<'_>,
        record_id: RecordId,
        source_id: u64,
        failure: &AnalysisFailure,
    ) -> Result<()> {
        self.sink.apply_failure(record_id, failure).await?;
        ctx.emitter.update_counters(|c| c.failed += 1);
        ctx.emitter.emit(EventKind::Error {
            id: Some(source_id),
            record_id: Some(record_id),
            reason: failure.reason(),
            fatal: false,
        });
        Ok(())
    }
}
