//! Cursor, lock and tenant models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::TenantId;

/// Per-tenant incremental watermark.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CursorDbModel {
    pub tenant_id: TenantId,
    pub watermark: i64,
    pub updated_at: i64,
}

/// Durable mutual-exclusion row.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct LockDbModel {
    pub tenant_id: TenantId,
    /// Lock kind: stream, auto
    pub kind: String,
    pub owner_token: String,
    /// Epoch millis of acquisition or last refresh
    pub acquired_at: i64,
}

/// A tenant known to the auto-sync worker.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TenantDbModel {
    pub id: TenantId,
    pub name: String,
    pub is_active: bool,
    pub auto_sync: bool,
    pub sync_interval_secs: i64,
    pub last_sync_at: Option<i64>,
}
