//! Write-back of analysis outcomes. Only the driver calls this.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::Result;
use crate::analysis::{AnalysisFailure, AnalysisResult};
use crate::archive::Archiver;
use crate::database::models::{RecordId, RecordStatus, TenantId};
use crate::database::repositories::{AnalysisTxOps, NewAnalysisResult, RecordRepository};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::datetime_to_ms;
use crate::database::{WritePool, begin_immediate};
use crate::schedule::Scheduler;

/// What an apply changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub entries_created: usize,
    /// Per-entry scheduling failures; the record stays `analyzed`.
    pub entry_errors: Vec<String>,
}

pub struct ResultSink {
    write_pool: WritePool,
    records: Arc<dyn RecordRepository>,
    scheduler: Arc<dyn Scheduler>,
    archiver: Arc<dyn Archiver>,
}

impl ResultSink {
    pub fn new(
        write_pool: WritePool,
        records: Arc<dyn RecordRepository>,
        scheduler: Arc<dyn Scheduler>,
        archiver: Arc<dyn Archiver>,
    ) -> Self {
        Self {
            write_pool,
            records,
            scheduler,
            archiver,
        }
    }

    /// Store a successful result, replacing any previous one.
    ///
    /// The result row and the `analyzed` status commit together. Derived
    /// entries are then rebuilt through the scheduler: old entries for the
    /// record are cleared first, so re-applying the same result is idempotent.
    pub async fn apply_success(
        &self,
        tenant: TenantId,
        record_id: RecordId,
        result: &AnalysisResult,
    ) -> Result<ApplyOutcome> {
        let row = NewAnalysisResult {
            summary: result.summary.clone(),
            importance_score: i64::from(result.importance_score),
            importance_reason: result.importance_reason.clone(),
            entries_json: serde_json::to_string(&result.derived_entries)?,
            model_tag: result.model_tag.clone(),
            produced_at: datetime_to_ms(result.produced_at),
        };

        let pool = &self.write_pool;
        let row = &row;
        retry_on_sqlite_busy("apply_analysis_result", || async move {
            let mut tx = begin_immediate(pool).await?;
            AnalysisTxOps::delete_result(&mut tx, record_id).await?;
            AnalysisTxOps::insert_result(&mut tx, tenant, record_id, row).await?;
            AnalysisTxOps::set_record_status(&mut tx, record_id, RecordStatus::Analyzed, None)
                .await?;
            tx.commit().await?;
            Ok::<(), crate::Error>(())
        })
        .await?;

        let mut outcome = ApplyOutcome::default();
        match self.scheduler.clear_entries(tenant, record_id).await {
            Ok(cleared) if cleared > 0 => debug!(tenant, record_id, cleared, "cleared old entries"),
            Ok(_) => {}
            Err(e) => {
                warn!(tenant, record_id, error = %e, "failed to clear old entries");
                outcome.entry_errors.push(e.to_string());
            }
        }
        for entry in &result.derived_entries {
            match self.scheduler.create_entry(tenant, record_id, entry).await {
                Ok(_) => outcome.entries_created += 1,
                Err(e) => {
                    warn!(tenant, record_id, title = %entry.title, error = %e, "failed to create entry");
                    outcome.entry_errors.push(e.to_string());
                }
            }
        }

        match self.records.get_record(record_id).await {
            Ok(record) => {
                if let Err(e) = self.archiver.archive(tenant, &record, result).await {
                    warn!(tenant, record_id, error = %e, "archiving failed");
                }
            }
            Err(e) => warn!(tenant, record_id, error = %e, "record unavailable for archiving"),
        }

        Ok(outcome)
    }

    /// Mark a record `failed` with the failure reason. A previous result, if
    /// any, is left in place.
    pub async fn apply_failure(
        &self,
        record_id: RecordId,
        failure: &AnalysisFailure,
    ) -> Result<()> {
        let reason = failure.reason();
        let reason = reason.as_str();
        let pool = &self.write_pool;
        retry_on_sqlite_busy("apply_analysis_failure", || async move {
            let mut tx = begin_immediate(pool).await?;
            AnalysisTxOps::set_record_status(&mut tx, record_id, RecordStatus::Failed, Some(reason))
                .await?;
            tx.commit().await?;
            Ok::<(), crate::Error>(())
        })
        .await
    }

    /// Return a record that was queued but never analyzed to the backlog.
    pub async fn release_unstarted(&self, record_id: RecordId) -> Result<bool> {
        self.records.release_analyzing(record_id).await
    }
}
