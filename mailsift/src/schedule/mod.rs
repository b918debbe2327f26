//! Scheduling collaborator.
//!
//! Materializes derived entries from an analysis result. Only the result
//! sink calls into it, after the result itself is committed.

mod reminders;
mod sqlite;

pub use reminders::ReminderPolicy;
pub use sqlite::SqliteScheduler;

use async_trait::async_trait;
use thiserror::Error;

use crate::analysis::DerivedEntry;
use crate::database::models::{RecordId, TenantId};

/// Id of a created schedule entry.
pub type EntryId = i64;

#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("schedule store error: {0}")]
    Store(#[from] crate::Error),

    #[error("invalid entry: {0}")]
    InvalidEntry(String),
}

/// Schedule entry sink.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Remove every entry previously derived from `record_id`.
    async fn clear_entries(&self, tenant: TenantId, record_id: RecordId)
    -> Result<u64, ScheduleError>;

    async fn create_entry(
        &self,
        tenant: TenantId,
        record_id: RecordId,
        entry: &DerivedEntry,
    ) -> Result<EntryId, ScheduleError>;
}
