//! Watermark store and candidate planning.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::Result;
use crate::database::models::TenantId;
use crate::database::repositories::{CursorRepository, RecordRepository};
use crate::source::{MessageSource, SourceError};

/// Extra ids scanned below the bootstrap estimate.
pub const DEFAULT_BOOTSTRAP_BUFFER: u64 = 50;

/// How the candidate list was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingMode {
    /// Ids above the stored watermark.
    Incremental,
    /// No cursor yet but records exist: ids above an estimate derived from
    /// the source's next id.
    Bootstrap { estimated_start: u64 },
    /// Recent time window (fresh tenant, or source cannot report a next id).
    Window,
}

/// Candidates for one run.
#[derive(Debug, Clone)]
pub struct CandidatePlan {
    /// Stored watermark at plan time (0 when absent).
    pub watermark: u64,
    /// Ascending, deduplicated.
    pub candidates: Vec<u64>,
    pub mode: ListingMode,
    /// Set when listing failed; the run continues with the backlog only.
    pub listing_error: Option<SourceError>,
}

/// Durable per-tenant watermark.
pub struct CursorStore {
    cursors: Arc<dyn CursorRepository>,
    records: Arc<dyn RecordRepository>,
    bootstrap_buffer: u64,
}

impl CursorStore {
    pub fn new(cursors: Arc<dyn CursorRepository>, records: Arc<dyn RecordRepository>) -> Self {
        Self {
            cursors,
            records,
            bootstrap_buffer: DEFAULT_BOOTSTRAP_BUFFER,
        }
    }

    pub fn with_bootstrap_buffer(mut self, buffer: u64) -> Self {
        self.bootstrap_buffer = buffer;
        self
    }

    /// Current watermark, 0 if the tenant has none.
    pub async fn get(&self, tenant: TenantId) -> Result<u64> {
        Ok(self
            .cursors
            .get_watermark(tenant)
            .await?
            .map(|w| w.max(0) as u64)
            .unwrap_or(0))
    }

    /// Persist `max(current, candidate)` and return the stored watermark.
    pub async fn advance(&self, tenant: TenantId, candidate: u64) -> Result<u64> {
        let candidate = i64::try_from(candidate).unwrap_or(i64::MAX);
        let stored = self.cursors.advance_watermark(tenant, candidate).await?;
        debug!(tenant, watermark = stored, "watermark advanced");
        Ok(stored.max(0) as u64)
    }

    /// Resolve the candidate ids for a run.
    ///
    /// Store failures are returned as errors. Source failures are carried in
    /// [`CandidatePlan::listing_error`].
    pub async fn plan(
        &self,
        tenant: TenantId,
        source: &dyn MessageSource,
        lookback: Duration,
    ) -> Result<CandidatePlan> {
        let stored = self.cursors.get_watermark(tenant).await?;
        let watermark = stored.map(|w| w.max(0) as u64).unwrap_or(0);

        let (mode, listed) = match stored {
            Some(_) => (
                ListingMode::Incremental,
                source.list_ids_since(tenant, watermark).await,
            ),
            None => {
                let local = self.records.count_records(tenant).await?;
                let next = if local > 0 {
                    source.next_id(tenant).await
                } else {
                    Ok(None)
                };
                match next {
                    Ok(Some(next_id)) => {
                        let estimated_start = next_id.saturating_sub(local + self.bootstrap_buffer);
                        info!(
                            tenant,
                            next_id,
                            local,
                            estimated_start,
                            "bootstrapping cursor from source next id"
                        );
                        (
                            ListingMode::Bootstrap { estimated_start },
                            source.list_ids_since(tenant, estimated_start).await,
                        )
                    }
                    Ok(None) => (
                        ListingMode::Window,
                        source.list_ids_within(tenant, lookback).await,
                    ),
                    Err(e) => (ListingMode::Window, Err(e)),
                }
            }
        };

        let (mut candidates, listing_error) = match listed {
            Ok(ids) => (ids, None),
            Err(e) => (Vec::new(), Some(e)),
        };
        candidates.retain(|id| *id > watermark);
        candidates.sort_unstable();
        candidates.dedup();

        Ok(CandidatePlan {
            watermark,
            candidates,
            mode,
            listing_error,
        })
    }
}
