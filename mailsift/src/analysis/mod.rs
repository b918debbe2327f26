//! Content-analysis collaborator.
//!
//! An [`Analyzer`] turns a message into a summary, an importance score and a
//! list of derived schedule entries. Implementations must be safe to call
//! concurrently; the worker pool shares one instance across all workers.

mod openai;
mod parse;

pub use openai::{OpenAiCompatAnalyzer, OpenAiCompatConfig};
pub use parse::{extract_json_object, parse_analysis, parse_entry_time};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::database::models::TenantId;

/// Input handed to the analyzer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisInput {
    pub subject: String,
    pub body: String,
    pub received_at: Option<DateTime<Utc>>,
}

/// Per-call context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalysisContext {
    pub tenant: TenantId,
    /// "Now" for resolving relative dates in the content.
    pub reference_time: DateTime<Utc>,
}

/// Importance of a derived entry.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Importance {
    Important,
    #[default]
    Normal,
    Unimportant,
}

/// Shape of a derived entry in time.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    #[default]
    Point,
    Duration,
    Deadline,
}

/// A schedulable item extracted from a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedEntry {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub importance: Importance,
    #[serde(default)]
    pub kind: EntryKind,
}

/// Successful analysis output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub summary: String,
    /// 1..=10, higher is more important.
    pub importance_score: u8,
    pub importance_reason: String,
    pub derived_entries: Vec<DerivedEntry>,
    pub model_tag: String,
    pub produced_at: DateTime<Utc>,
}

/// Typed analysis failure. Every variant is item-scoped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnalysisFailure {
    #[error("timeout")]
    Timeout,

    /// The upstream refused the input for its size; the caller may shrink and retry.
    #[error("payload too large")]
    PayloadTooLarge,

    #[error("malformed output: {0}")]
    Malformed(String),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("worker panicked: {0}")]
    Panicked(String),
}

impl AnalysisFailure {
    /// Reason string stored on the record and sent in `error` events.
    pub fn reason(&self) -> String {
        self.to_string()
    }
}

/// Content-analysis service.
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(
        &self,
        input: &AnalysisInput,
        ctx: &AnalysisContext,
    ) -> Result<AnalysisResult, AnalysisFailure>;
}
