//! HTTP mailbox gateway source.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use super::{MessageHeader, MessagePayload, MessageSource, SourceError};
use crate::database::models::TenantId;
use crate::utils::http_client::build_client;
use crate::{Error, Result};

/// Mailbox gateway settings.
#[derive(Debug, Clone)]
pub struct HttpMailboxSourceConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub request_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct MailboxStatus {
    #[serde(default)]
    uid_next: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct IdList {
    ids: Vec<u64>,
}

/// [`MessageSource`] backed by a REST mailbox gateway.
pub struct HttpMailboxSource {
    client: Client,
    base_url: Url,
    token: Option<String>,
}

impl HttpMailboxSource {
    pub fn new(config: HttpMailboxSourceConfig) -> Result<Self> {
        let mut base = config.base_url.trim_end_matches('/').to_string();
        base.push('/');
        let base_url = Url::parse(&base)
            .map_err(|e| Error::config(format!("invalid source base url: {e}")))?;

        Ok(Self {
            client: build_client(config.request_timeout)?,
            base_url,
            token: config.token,
        })
    }

    fn endpoint(&self, path: &str) -> std::result::Result<Url, SourceError> {
        self.base_url
            .join(path)
            .map_err(|e| SourceError::Malformed(format!("bad endpoint {path}: {e}")))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: Url,
        missing_id: Option<u64>,
    ) -> std::result::Result<T, SourceError> {
        let mut request = self.client.get(url.clone());
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SourceError::Transient(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND
            && let Some(id) = missing_id
        {
            return Err(SourceError::NotFound(id));
        }
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(SourceError::Transient(format!("{url} returned {status}")));
        }
        if !status.is_success() {
            return Err(SourceError::Malformed(format!("{url} returned {status}")));
        }

        debug!(%url, %status, "source request completed");

        response
            .json::<T>()
            .await
            .map_err(|e| SourceError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl MessageSource for HttpMailboxSource {
    async fn next_id(&self, tenant: TenantId) -> std::result::Result<Option<u64>, SourceError> {
        let url = self.endpoint(&format!("tenants/{tenant}/mailbox/status"))?;
        let status: MailboxStatus = self.get_json(url, None).await?;
        Ok(status.uid_next)
    }

    async fn list_ids_since(
        &self,
        tenant: TenantId,
        after: u64,
    ) -> std::result::Result<Vec<u64>, SourceError> {
        let mut url = self.endpoint(&format!("tenants/{tenant}/messages"))?;
        url.query_pairs_mut().append_pair("after", &after.to_string());
        let mut list: IdList = self.get_json(url, None).await?;
        list.ids.retain(|id| *id > after);
        list.ids.sort_unstable();
        list.ids.dedup();
        Ok(list.ids)
    }

    async fn list_ids_within(
        &self,
        tenant: TenantId,
        window: Duration,
    ) -> std::result::Result<Vec<u64>, SourceError> {
        let window = chrono::Duration::from_std(window)
            .map_err(|e| SourceError::Malformed(format!("window out of range: {e}")))?;
        let since = Utc::now() - window;

        let mut url = self.endpoint(&format!("tenants/{tenant}/messages"))?;
        url.query_pairs_mut()
            .append_pair("since", &since.to_rfc3339());
        let mut list: IdList = self.get_json(url, None).await?;
        list.ids.sort_unstable();
        list.ids.dedup();
        Ok(list.ids)
    }

    async fn fetch_header(
        &self,
        tenant: TenantId,
        id: u64,
    ) -> std::result::Result<MessageHeader, SourceError> {
        let url = self.endpoint(&format!("tenants/{tenant}/messages/{id}/header"))?;
        self.get_json(url, Some(id)).await
    }

    async fn fetch_full(
        &self,
        tenant: TenantId,
        id: u64,
    ) -> std::result::Result<MessagePayload, SourceError> {
        let url = self.endpoint(&format!("tenants/{tenant}/messages/{id}"))?;
        self.get_json(url, Some(id)).await
    }
}
