//! Notification channels.

mod log;
mod webhook;

pub use log::LogChannel;
pub use webhook::{WebhookAuth, WebhookChannel, WebhookConfig};

use async_trait::async_trait;

use super::ReminderNotice;
use crate::Result;

/// Trait for notification channels.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Stable channel name, used as the delivery-tracking key.
    fn name(&self) -> &str;

    async fn send(&self, notice: &ReminderNotice) -> Result<()>;
}
