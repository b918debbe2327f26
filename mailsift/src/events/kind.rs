//! Progress event payloads.
//!
//! Events serialize flat: `{"seq": 3, "ts": "...", "status": "saved", "id": 101, ...}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::database::models::RecordId;

/// Run counters carried by `progress`, `cancelled` and `completed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub scanned: u64,
    pub saved: u64,
    pub analyzed: u64,
    pub failed: u64,
    pub skipped: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EventKind {
    Started {
        run_id: String,
        message: String,
    },
    Info {
        message: String,
    },
    Stats {
        candidates: u64,
        backlog: u64,
        watermark: u64,
    },
    Saving {
        id: u64,
    },
    Saved {
        id: u64,
        record_id: RecordId,
        subject: String,
    },
    Analyzing {
        record_id: RecordId,
        id: u64,
    },
    Reanalyzing {
        record_id: RecordId,
        id: u64,
    },
    Analyzed {
        record_id: RecordId,
        id: u64,
        summary: String,
        entries: usize,
    },
    Skipped {
        id: u64,
        skipped: u64,
    },
    Progress {
        processed: u64,
        total: u64,
        #[serde(flatten)]
        counters: Counters,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        record_id: Option<RecordId>,
        reason: String,
        fatal: bool,
    },
    Cancelled {
        #[serde(flatten)]
        counters: Counters,
    },
    Completed {
        #[serde(flatten)]
        counters: Counters,
    },
    Keepalive {},
}

impl EventKind {
    /// Whether this event ends a run's stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Cancelled { .. } | Self::Error { fatal: true, .. }
        )
    }

    pub fn status(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::Info { .. } => "info",
            Self::Stats { .. } => "stats",
            Self::Saving { .. } => "saving",
            Self::Saved { .. } => "saved",
            Self::Analyzing { .. } => "analyzing",
            Self::Reanalyzing { .. } => "reanalyzing",
            Self::Analyzed { .. } => "analyzed",
            Self::Skipped { .. } => "skipped",
            Self::Progress { .. } => "progress",
            Self::Error { .. } => "error",
            Self::Cancelled { .. } => "cancelled",
            Self::Completed { .. } => "completed",
            Self::Keepalive {} => "keepalive",
        }
    }
}

/// A published event with its per-tenant sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub seq: u64,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_serialize_flat() {
        let event = ProgressEvent {
            seq: 7,
            ts: Utc::now(),
            kind: EventKind::Saved {
                id: 101,
                record_id: 3,
                subject: "hello".to_string(),
            },
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["seq"], 7);
        assert_eq!(value["status"], "saved");
        assert_eq!(value["id"], 101);
        assert_eq!(value["record_id"], 3);
        assert!(value.get("kind").is_none());
    }

    #[test]
    fn test_counters_serialize_inline() {
        let event = ProgressEvent {
            seq: 9,
            ts: Utc::now(),
            kind: EventKind::Completed {
                counters: Counters {
                    saved: 2,
                    analyzed: 1,
                    ..Default::default()
                },
            },
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["status"], "completed");
        assert_eq!(value["saved"], 2);
        assert_eq!(value["analyzed"], 1);
        assert_eq!(value["failed"], 0);
        assert!(value.get("counters").is_none());

        let back: ProgressEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);

        let progress = serde_json::to_value(EventKind::Progress {
            processed: 10,
            total: 40,
            counters: Counters::default(),
        })
        .unwrap();
        assert_eq!(progress["processed"], 10);
        assert_eq!(progress["scanned"], 0);
    }

    #[test]
    fn test_error_omits_missing_ids() {
        let kind = EventKind::Error {
            id: Some(105),
            record_id: None,
            reason: "timeout".to_string(),
            fatal: false,
        };
        let value = serde_json::to_value(&kind).unwrap();
        assert_eq!(value["status"], "error");
        assert_eq!(value["id"], 105);
        assert!(value.get("record_id").is_none());
        assert!(!kind.is_terminal());
    }

    #[test]
    fn test_terminal_kinds() {
        assert!(EventKind::Completed { counters: Counters::default() }.is_terminal());
        assert!(EventKind::Cancelled { counters: Counters::default() }.is_terminal());
        assert!(
            EventKind::Error {
                id: None,
                record_id: None,
                reason: "store down".to_string(),
                fatal: true
            }
            .is_terminal()
        );
        assert!(!EventKind::Keepalive {}.is_terminal());
        assert_eq!(EventKind::Keepalive {}.status(), "keepalive");
    }
}
