//! Message source collaborator.
//!
//! The pipeline only needs cheap id listing, a cheap identity probe per id and
//! a full fetch. Ids are assigned monotonically by the source.

mod http;

pub use http::{HttpMailboxSource, HttpMailboxSourceConfig};

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::database::models::TenantId;

/// Errors surfaced by a message source.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// Network blip or upstream 5xx; retried naturally by the next run.
    #[error("transient source error: {0}")]
    Transient(String),

    #[error("message {0} not found")]
    NotFound(u64),

    #[error("malformed source response: {0}")]
    Malformed(String),
}

/// Cheap identity probe of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub id: u64,
    /// Stable message id when the source provides one.
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub received_at: Option<DateTime<Utc>>,
}

/// Full message contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    #[serde(flatten)]
    pub header: MessageHeader,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub html_body: Option<String>,
}

/// Source of messages for a tenant.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// The id the source will assign next, if it can report one.
    async fn next_id(&self, tenant: TenantId) -> Result<Option<u64>, SourceError>;

    /// Ids strictly greater than `after`, ascending.
    async fn list_ids_since(&self, tenant: TenantId, after: u64) -> Result<Vec<u64>, SourceError>;

    /// Ids of messages received within `window` of now, ascending.
    async fn list_ids_within(
        &self,
        tenant: TenantId,
        window: Duration,
    ) -> Result<Vec<u64>, SourceError>;

    async fn fetch_header(&self, tenant: TenantId, id: u64) -> Result<MessageHeader, SourceError>;

    async fn fetch_full(&self, tenant: TenantId, id: u64) -> Result<MessagePayload, SourceError>;
}
