//! Due-reminder fan-out with per-channel delivery tracking.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::channels::NotificationChannel;
use crate::Result;
use crate::database::models::{DueReminderDbModel, TenantId};
use crate::database::repositories::ScheduleRepository;
use crate::database::time::{datetime_to_ms, ms_to_datetime};

const DEFAULT_BATCH_LIMIT: i64 = 200;

/// A due reminder as handed to channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReminderNotice {
    pub reminder_id: i64,
    pub tenant_id: TenantId,
    pub event_id: i64,
    pub title: String,
    pub description: String,
    pub start_time: DateTime<Utc>,
    pub location: String,
    pub importance: String,
    pub remind_at: DateTime<Utc>,
}

impl From<DueReminderDbModel> for ReminderNotice {
    fn from(row: DueReminderDbModel) -> Self {
        Self {
            reminder_id: row.reminder_id,
            tenant_id: row.tenant_id,
            event_id: row.event_id,
            title: row.title,
            description: row.description,
            start_time: ms_to_datetime(row.start_time),
            location: row.location,
            importance: row.importance,
            remind_at: ms_to_datetime(row.remind_at),
        }
    }
}

/// Result of one dispatch pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchSummary {
    /// Due reminders examined.
    pub due: usize,
    /// Successful channel deliveries.
    pub delivered: usize,
    /// Failed channel deliveries.
    pub failed: usize,
    /// Reminders now delivered on every channel.
    pub completed: usize,
}

pub struct ReminderDispatcher {
    schedule: Arc<dyn ScheduleRepository>,
    channels: Vec<Arc<dyn NotificationChannel>>,
    batch_limit: i64,
}

impl ReminderDispatcher {
    pub fn new(
        schedule: Arc<dyn ScheduleRepository>,
        channels: Vec<Arc<dyn NotificationChannel>>,
    ) -> Self {
        Self {
            schedule,
            channels,
            batch_limit: DEFAULT_BATCH_LIMIT,
        }
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.name().to_string()).collect()
    }

    /// Deliver every reminder of `tenant` due at `now`.
    pub async fn dispatch_due(&self, tenant: TenantId, now: DateTime<Utc>) -> Result<DispatchSummary> {
        let due = self
            .schedule
            .list_due_reminders(tenant, datetime_to_ms(now), self.batch_limit)
            .await?;

        let mut summary = DispatchSummary {
            due: due.len(),
            ..Default::default()
        };

        for row in due {
            let notice = ReminderNotice::from(row);
            let already_sent: HashSet<String> = self
                .schedule
                .list_deliveries(notice.reminder_id)
                .await?
                .into_iter()
                .filter(|d| d.is_sent)
                .map(|d| d.channel)
                .collect();

            let mut all_sent = true;
            for channel in &self.channels {
                let name = channel.name();
                if already_sent.contains(name) {
                    continue;
                }
                match channel.send(&notice).await {
                    Ok(()) => {
                        self.schedule
                            .record_delivery(notice.reminder_id, name, true, None)
                            .await?;
                        summary.delivered += 1;
                    }
                    Err(e) => {
                        warn!(
                            tenant,
                            reminder_id = notice.reminder_id,
                            channel = name,
                            error = %e,
                            "reminder delivery failed"
                        );
                        let reason = e.to_string();
                        self.schedule
                            .record_delivery(notice.reminder_id, name, false, Some(&reason))
                            .await?;
                        summary.failed += 1;
                        all_sent = false;
                    }
                }
            }

            if all_sent {
                self.schedule
                    .mark_reminder_sent(notice.reminder_id, datetime_to_ms(now))
                    .await?;
                summary.completed += 1;
            }
        }

        if summary.due > 0 {
            info!(
                tenant,
                due = summary.due,
                delivered = summary.delivered,
                failed = summary.failed,
                "reminder dispatch finished"
            );
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::database::repositories::{NewScheduledEvent, SqlxScheduleRepository};
    use crate::testing::RecordingChannel;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Arc<SqlxScheduleRepository>, i64) {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("t.db").display());
        let db = Database::open(&url).await.unwrap();
        let repo = Arc::new(SqlxScheduleRepository::new(db.pool.clone()));
        let event_id = repo
            .insert_event(&NewScheduledEvent {
                tenant_id: 1,
                record_id: None,
                title: "Exam".to_string(),
                description: String::new(),
                start_time: 10_000,
                end_time: None,
                location: String::new(),
                importance: "important".to_string(),
                kind: "point".to_string(),
            })
            .await
            .unwrap();
        let reminder = repo.insert_reminder(1, event_id, 1_000).await.unwrap();
        (dir, repo, reminder)
    }

    #[tokio::test]
    async fn test_failed_channel_is_retried_alone() {
        let (_dir, repo, reminder) = setup().await;
        let ok = Arc::new(RecordingChannel::new("ok"));
        let flaky = Arc::new(RecordingChannel::new("flaky"));
        flaky.fail_next(1);

        let dispatcher = ReminderDispatcher::new(
            repo.clone(),
            vec![
                ok.clone() as Arc<dyn NotificationChannel>,
                flaky.clone() as Arc<dyn NotificationChannel>,
            ],
        );
        let now = ms_to_datetime(5_000);

        let first = dispatcher.dispatch_due(1, now).await.unwrap();
        assert_eq!(
            first,
            DispatchSummary {
                due: 1,
                delivered: 1,
                failed: 1,
                completed: 0
            }
        );

        let second = dispatcher.dispatch_due(1, now).await.unwrap();
        assert_eq!(second.delivered, 1);
        assert_eq!(second.completed, 1);
        assert_eq!(ok.sent().len(), 1);
        assert_eq!(flaky.sent().len(), 1);

        let third = dispatcher.dispatch_due(1, now).await.unwrap();
        assert_eq!(third.due, 0);

        let deliveries = repo.list_deliveries(reminder).await.unwrap();
        let flaky_row = deliveries.iter().find(|d| d.channel == "flaky").unwrap();
        assert!(flaky_row.is_sent);
        assert_eq!(flaky_row.attempts, 2);
    }
}
