//! Ingested record models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::{RecordId, TenantId};

/// A durably stored source item.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct RecordDbModel {
    pub id: RecordId,
    pub tenant_id: TenantId,
    /// Stable per-tenant identity (message id, or synthetic fallback).
    pub identity_key: String,
    /// Id assigned by the source; monotonically increasing per mailbox.
    pub source_id: i64,
    pub subject: String,
    pub sender: String,
    pub body: String,
    pub html_body: Option<String>,
    pub received_at: Option<i64>,
    /// Status: unanalyzed, analyzing, analyzed, failed
    pub status: String,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl RecordDbModel {
    /// Parsed status; unknown values are treated as `Unanalyzed` so they get swept.
    pub fn status(&self) -> RecordStatus {
        RecordStatus::parse(&self.status).unwrap_or(RecordStatus::Unanalyzed)
    }
}

/// Fields for inserting a new record.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub tenant_id: TenantId,
    pub identity_key: String,
    pub source_id: i64,
    pub subject: String,
    pub sender: String,
    pub body: String,
    pub html_body: Option<String>,
    pub received_at: Option<i64>,
}

/// Analysis status of a record.
///
/// Transitions: unanalyzed|failed -> analyzing -> analyzed|failed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Unanalyzed,
    Analyzing,
    Analyzed,
    Failed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unanalyzed => "unanalyzed",
            Self::Analyzing => "analyzing",
            Self::Analyzed => "analyzed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unanalyzed" => Some(Self::Unanalyzed),
            "analyzing" => Some(Self::Analyzing),
            "analyzed" => Some(Self::Analyzed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Whether a record in this status belongs to the backlog sweep.
    pub fn needs_analysis(&self) -> bool {
        matches!(self, Self::Unanalyzed | Self::Failed)
    }
}

/// Per-status record counts for a tenant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordCounts {
    pub unanalyzed: u64,
    pub analyzing: u64,
    pub analyzed: u64,
    pub failed: u64,
}

impl RecordCounts {
    pub fn total(&self) -> u64 {
        self.unanalyzed + self.analyzing + self.analyzed + self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_through_strings() {
        for status in [
            RecordStatus::Unanalyzed,
            RecordStatus::Analyzing,
            RecordStatus::Analyzed,
            RecordStatus::Failed,
        ] {
            assert_eq!(RecordStatus::parse(status.as_str()), Some(status));
            assert_eq!(status.to_string(), status.as_str());
        }
        assert_eq!(RecordStatus::parse("bogus"), None);
    }

    #[test]
    fn test_backlog_membership() {
        assert!(RecordStatus::Unanalyzed.needs_analysis());
        assert!(RecordStatus::Failed.needs_analysis());
        assert!(!RecordStatus::Analyzing.needs_analysis());
        assert!(!RecordStatus::Analyzed.needs_analysis());
    }
}
