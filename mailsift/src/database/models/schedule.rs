//! Scheduled event, reminder and delivery models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::{RecordId, TenantId};

/// Calendar-style event derived from an analysis result.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ScheduledEventDbModel {
    pub id: i64,
    pub tenant_id: TenantId,
    pub record_id: Option<RecordId>,
    pub title: String,
    pub description: String,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub location: String,
    pub importance: String,
    pub kind: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ReminderDbModel {
    pub id: i64,
    pub tenant_id: TenantId,
    pub event_id: i64,
    pub remind_at: i64,
    pub is_sent: bool,
    pub sent_at: Option<i64>,
    pub created_at: i64,
}

/// A due reminder joined with its event, ready for fan-out.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DueReminderDbModel {
    pub reminder_id: i64,
    pub tenant_id: TenantId,
    pub event_id: i64,
    pub remind_at: i64,
    pub title: String,
    pub description: String,
    pub start_time: i64,
    pub location: String,
    pub importance: String,
}

/// Delivery state of one reminder on one channel.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ReminderDeliveryDbModel {
    pub id: i64,
    pub reminder_id: i64,
    pub channel: String,
    pub is_sent: bool,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub updated_at: i64,
}
