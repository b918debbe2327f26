//! Analysis result models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::{RecordId, TenantId};

/// Stored analysis result. At most one per record.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct AnalysisResultDbModel {
    pub id: i64,
    pub tenant_id: TenantId,
    pub record_id: RecordId,
    pub summary: String,
    pub importance_score: i64,
    pub importance_reason: String,
    /// JSON array of derived entries
    pub entries_json: String,
    pub model_tag: String,
    pub produced_at: i64,
}
