//! SQLite-backed scheduler.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use super::{EntryId, ReminderPolicy, ScheduleError, Scheduler};
use crate::analysis::DerivedEntry;
use crate::database::models::{RecordId, TenantId};
use crate::database::repositories::{NewScheduledEvent, ScheduleRepository};
use crate::database::time::datetime_to_ms;

/// Writes entries to `scheduled_events` and their `reminders`.
pub struct SqliteScheduler {
    repo: Arc<dyn ScheduleRepository>,
    policy: ReminderPolicy,
}

impl SqliteScheduler {
    pub fn new(repo: Arc<dyn ScheduleRepository>) -> Self {
        Self {
            repo,
            policy: ReminderPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: ReminderPolicy) -> Self {
        self.policy = policy;
        self
    }
}

#[async_trait]
impl Scheduler for SqliteScheduler {
    async fn clear_entries(
        &self,
        tenant: TenantId,
        record_id: RecordId,
    ) -> Result<u64, ScheduleError> {
        Ok(self.repo.clear_for_record(tenant, record_id).await?)
    }

    async fn create_entry(
        &self,
        tenant: TenantId,
        record_id: RecordId,
        entry: &DerivedEntry,
    ) -> Result<EntryId, ScheduleError> {
        if entry.title.trim().is_empty() {
            return Err(ScheduleError::InvalidEntry("empty title".to_string()));
        }
        if let Some(end) = entry.end_time
            && end < entry.start_time
        {
            return Err(ScheduleError::InvalidEntry(format!(
                "'{}' ends before it starts",
                entry.title
            )));
        }

        let event_id = self
            .repo
            .insert_event(&NewScheduledEvent {
                tenant_id: tenant,
                record_id: Some(record_id),
                title: entry.title.clone(),
                description: entry.description.clone(),
                start_time: datetime_to_ms(entry.start_time),
                end_time: entry.end_time.map(datetime_to_ms),
                location: entry.location.clone(),
                importance: entry.importance.to_string(),
                kind: entry.kind.to_string(),
            })
            .await?;

        let times = self
            .policy
            .reminder_times(entry.start_time, entry.importance, Utc::now());
        for at in &times {
            self.repo
                .insert_reminder(tenant, event_id, datetime_to_ms(*at))
                .await?;
        }

        debug!(
            tenant,
            record_id,
            event_id,
            reminders = times.len(),
            "created schedule entry"
        );
        Ok(event_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{EntryKind, Importance};
    use crate::database::Database;
    use crate::database::repositories::SqlxScheduleRepository;
    use chrono::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_create_then_clear_entries() {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("t.db").display());
        let db = Database::open(&url).await.unwrap();
        let record_id: i64 = sqlx::query_scalar(
            "INSERT INTO records (tenant_id, identity_key, source_id, created_at, updated_at) VALUES (1, 'k', 1, 0, 0) RETURNING id",
        )
        .fetch_one(&db.pool)
        .await
        .unwrap();

        let repo = Arc::new(SqlxScheduleRepository::new(db.pool.clone()));
        let scheduler = SqliteScheduler::new(repo.clone());
        let entry = DerivedEntry {
            title: "Project deadline".to_string(),
            description: String::new(),
            start_time: Utc::now() + Duration::days(10),
            end_time: None,
            location: String::new(),
            importance: Importance::Important,
            kind: EntryKind::Deadline,
        };

        let event_id = scheduler.create_entry(1, record_id, &entry).await.unwrap();
        let events = repo.list_events_for_record(record_id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, "deadline");
        assert_eq!(repo.list_reminders_for_event(event_id).await.unwrap().len(), 3);

        assert_eq!(scheduler.clear_entries(1, record_id).await.unwrap(), 1);
        assert!(repo.list_events_for_record(record_id).await.unwrap().is_empty());
        assert!(repo.list_reminders_for_event(event_id).await.unwrap().is_empty());
    }
}
