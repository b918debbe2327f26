//! Scheduled event and reminder repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::Result;
use crate::database::models::{
    DueReminderDbModel, RecordId, ReminderDbModel, ReminderDeliveryDbModel,
    ScheduledEventDbModel, TenantId,
};
use crate::database::time::now_ms;

/// Fields for inserting a scheduled event.
#[derive(Debug, Clone)]
pub struct NewScheduledEvent {
    pub tenant_id: TenantId,
    pub record_id: Option<RecordId>,
    pub title: String,
    pub description: String,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub location: String,
    pub importance: String,
    pub kind: String,
}

/// Schedule repository trait.
#[async_trait]
pub trait ScheduleRepository: Send + Sync {
    /// Delete events derived from a record. Their reminders cascade.
    async fn clear_for_record(&self, tenant: TenantId, record_id: RecordId) -> Result<u64>;
    async fn insert_event(&self, event: &NewScheduledEvent) -> Result<i64>;
    async fn insert_reminder(&self, tenant: TenantId, event_id: i64, remind_at: i64)
    -> Result<i64>;
    async fn list_events_for_record(&self, record_id: RecordId)
    -> Result<Vec<ScheduledEventDbModel>>;
    async fn list_reminders_for_event(&self, event_id: i64) -> Result<Vec<ReminderDbModel>>;
    /// Unsent reminders with `remind_at <= now`, oldest first.
    async fn list_due_reminders(
        &self,
        tenant: TenantId,
        now: i64,
        limit: i64,
    ) -> Result<Vec<DueReminderDbModel>>;
    async fn list_deliveries(&self, reminder_id: i64) -> Result<Vec<ReminderDeliveryDbModel>>;
    /// Upsert the delivery row for (reminder, channel), bumping `attempts`.
    async fn record_delivery(
        &self,
        reminder_id: i64,
        channel: &str,
        sent: bool,
        error: Option<&str>,
    ) -> Result<()>;
    async fn mark_reminder_sent(&self, reminder_id: i64, at: i64) -> Result<()>;
}

/// SQLx implementation of ScheduleRepository.
pub struct SqlxScheduleRepository {
    pool: SqlitePool,
}

impl SqlxScheduleRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ScheduleRepository for SqlxScheduleRepository {
    async fn clear_for_record(&self, tenant: TenantId, record_id: RecordId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM scheduled_events WHERE tenant_id = ? AND record_id = ?")
            .bind(tenant)
            .bind(record_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn insert_event(&self, event: &NewScheduledEvent) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO scheduled_events (
                tenant_id, record_id, title, description, start_time, end_time,
                location, importance, kind, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(event.tenant_id)
        .bind(event.record_id)
        .bind(&event.title)
        .bind(&event.description)
        .bind(event.start_time)
        .bind(event.end_time)
        .bind(&event.location)
        .bind(&event.importance)
        .bind(&event.kind)
        .bind(now_ms())
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn insert_reminder(
        &self,
        tenant: TenantId,
        event_id: i64,
        remind_at: i64,
    ) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO reminders (tenant_id, event_id, remind_at, is_sent, created_at)
            VALUES (?, ?, ?, 0, ?)
            RETURNING id
            "#,
        )
        .bind(tenant)
        .bind(event_id)
        .bind(remind_at)
        .bind(now_ms())
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn list_events_for_record(
        &self,
        record_id: RecordId,
    ) -> Result<Vec<ScheduledEventDbModel>> {
        let events = sqlx::query_as::<_, ScheduledEventDbModel>(
            "SELECT * FROM scheduled_events WHERE record_id = ? ORDER BY start_time, id",
        )
        .bind(record_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }

    async fn list_reminders_for_event(&self, event_id: i64) -> Result<Vec<ReminderDbModel>> {
        let reminders = sqlx::query_as::<_, ReminderDbModel>(
            "SELECT * FROM reminders WHERE event_id = ? ORDER BY remind_at",
        )
        .bind(event_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(reminders)
    }

    async fn list_due_reminders(
        &self,
        tenant: TenantId,
        now: i64,
        limit: i64,
    ) -> Result<Vec<DueReminderDbModel>> {
        let due = sqlx::query_as::<_, DueReminderDbModel>(
            r#"
            SELECT
                r.id AS reminder_id, r.tenant_id, r.event_id, r.remind_at,
                e.title, e.description, e.start_time, e.location, e.importance
            FROM reminders r
            JOIN scheduled_events e ON e.id = r.event_id
            WHERE r.tenant_id = ? AND r.is_sent = 0 AND r.remind_at <= ?
            ORDER BY r.remind_at, r.id
            LIMIT ?
            "#,
        )
        .bind(tenant)
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(due)
    }

    async fn list_deliveries(&self, reminder_id: i64) -> Result<Vec<ReminderDeliveryDbModel>> {
        let rows = sqlx::query_as::<_, ReminderDeliveryDbModel>(
            "SELECT * FROM reminder_deliveries WHERE reminder_id = ? ORDER BY channel",
        )
        .bind(reminder_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn record_delivery(
        &self,
        reminder_id: i64,
        channel: &str,
        sent: bool,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO reminder_deliveries (reminder_id, channel, is_sent, attempts, last_error, updated_at)
            VALUES (?, ?, ?, 1, ?, ?)
            ON CONFLICT (reminder_id, channel) DO UPDATE SET
                is_sent = excluded.is_sent,
                attempts = reminder_deliveries.attempts + 1,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(reminder_id)
        .bind(channel)
        .bind(sent)
        .bind(error)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_reminder_sent(&self, reminder_id: i64, at: i64) -> Result<()> {
        sqlx::query("UPDATE reminders SET is_sent = 1, sent_at = ? WHERE id = ?")
            .bind(at)
            .bind(reminder_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Database) {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("t.db").display());
        let db = Database::open(&url).await.unwrap();
        (dir, db)
    }

    fn event(title: &str, start: i64) -> NewScheduledEvent {
        NewScheduledEvent {
            tenant_id: 1,
            record_id: None,
            title: title.to_string(),
            description: String::new(),
            start_time: start,
            end_time: None,
            location: String::new(),
            importance: "normal".to_string(),
            kind: "point".to_string(),
        }
    }

    #[tokio::test]
    async fn test_due_reminders_exclude_future_and_sent() {
        let (_dir, db) = setup().await;
        let repo = SqlxScheduleRepository::new(db.pool.clone());

        let event_id = repo.insert_event(&event("exam", 10_000)).await.unwrap();
        let due = repo.insert_reminder(1, event_id, 1_000).await.unwrap();
        let sent = repo.insert_reminder(1, event_id, 2_000).await.unwrap();
        repo.insert_reminder(1, event_id, 9_000).await.unwrap();
        repo.mark_reminder_sent(sent, 2_500).await.unwrap();

        let list = repo.list_due_reminders(1, 5_000, 10).await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].reminder_id, due);
        assert_eq!(list[0].title, "exam");

        assert!(repo.list_due_reminders(2, 5_000, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delivery_upsert_counts_attempts() {
        let (_dir, db) = setup().await;
        let repo = SqlxScheduleRepository::new(db.pool.clone());

        let event_id = repo.insert_event(&event("exam", 10_000)).await.unwrap();
        let reminder = repo.insert_reminder(1, event_id, 1_000).await.unwrap();

        repo.record_delivery(reminder, "webhook", false, Some("503"))
            .await
            .unwrap();
        repo.record_delivery(reminder, "webhook", true, None)
            .await
            .unwrap();

        let rows = repo.list_deliveries(reminder).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].is_sent);
        assert_eq!(rows[0].attempts, 2);
        assert!(rows[0].last_error.is_none());
    }
}
