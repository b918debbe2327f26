//! Reminder notifications.
//!
//! Due reminders are fanned out to every configured channel. Delivery state
//! is tracked per (reminder, channel), so a channel that already succeeded
//! is never re-sent when another channel is retried.

pub mod channels;
mod dispatcher;

pub use channels::{LogChannel, NotificationChannel, WebhookAuth, WebhookChannel, WebhookConfig};
pub use dispatcher::{DispatchSummary, ReminderDispatcher, ReminderNotice};
