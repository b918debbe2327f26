//! Channel that writes reminders to the log.

use async_trait::async_trait;
use tracing::info;

use super::NotificationChannel;
use crate::Result;
use crate::notification::ReminderNotice;

#[derive(Debug, Default, Clone, Copy)]
pub struct LogChannel;

#[async_trait]
impl NotificationChannel for LogChannel {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, notice: &ReminderNotice) -> Result<()> {
        info!(
            tenant = notice.tenant_id,
            reminder_id = notice.reminder_id,
            title = %notice.title,
            start_time = %notice.start_time,
            importance = %notice.importance,
            "reminder due"
        );
        Ok(())
    }
}
