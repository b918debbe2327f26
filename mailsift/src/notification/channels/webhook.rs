//! Generic webhook notification channel.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, header::HeaderMap};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use super::NotificationChannel;
use crate::notification::ReminderNotice;
use crate::utils::http_client::build_client;
use crate::{Error, Result};

/// Webhook channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    /// Custom headers.
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    pub auth: Option<WebhookAuth>,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_timeout() -> u64 {
    30
}

/// Webhook authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WebhookAuth {
    Bearer { token: String },
    Header { name: String, value: String },
}

impl WebhookConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
            auth: None,
            timeout_secs: default_timeout(),
        }
    }
}

/// POSTs each reminder as JSON.
pub struct WebhookChannel {
    config: WebhookConfig,
    client: Client,
}

impl WebhookChannel {
    pub fn new(config: WebhookConfig) -> Result<Self> {
        if config.url.trim().is_empty() {
            return Err(Error::config("webhook url is empty"));
        }
        let client = build_client(Duration::from_secs(config.timeout_secs))?;
        Ok(Self { config, client })
    }

    fn build_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();

        for (name, value) in &self.config.headers {
            if let (Ok(name), Ok(value)) = (
                name.parse::<reqwest::header::HeaderName>(),
                value.parse::<reqwest::header::HeaderValue>(),
            ) {
                headers.insert(name, value);
            }
        }

        match &self.config.auth {
            Some(WebhookAuth::Bearer { token }) => {
                if let Ok(value) = format!("Bearer {}", token).parse() {
                    headers.insert(reqwest::header::AUTHORIZATION, value);
                }
            }
            Some(WebhookAuth::Header { name, value }) => {
                if let (Ok(name), Ok(value)) = (
                    name.parse::<reqwest::header::HeaderName>(),
                    value.parse::<reqwest::header::HeaderValue>(),
                ) {
                    headers.insert(name, value);
                }
            }
            None => {}
        }

        headers
    }

    fn build_payload(notice: &ReminderNotice) -> serde_json::Value {
        json!({
            "event_type": "reminder_due",
            "tenant_id": notice.tenant_id,
            "title": notice.title,
            "description": notice.description,
            "start_time": notice.start_time.to_rfc3339(),
            "location": notice.location,
            "importance": notice.importance,
            "remind_at": notice.remind_at.to_rfc3339(),
            "data": notice,
        })
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, notice: &ReminderNotice) -> Result<()> {
        let response = self
            .client
            .post(&self.config.url)
            .headers(self.build_headers())
            .json(&Self::build_payload(notice))
            .send()
            .await
            .map_err(|e| Error::Other(format!("Webhook request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(reminder_id = notice.reminder_id, %status, "webhook rejected reminder");
            return Err(Error::Other(format!("Webhook failed: {} - {}", status, body)));
        }

        debug!(reminder_id = notice.reminder_id, "webhook reminder sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_empty_url_is_rejected() {
        assert!(WebhookChannel::new(WebhookConfig::new("  ")).is_err());
    }

    #[test]
    fn test_headers_include_auth_and_custom() {
        let mut config = WebhookConfig::new("http://hooks.local/reminders");
        config.headers.push(("X-Source".to_string(), "mailsift".to_string()));
        config.auth = Some(WebhookAuth::Bearer {
            token: "secret".to_string(),
        });
        let channel = WebhookChannel::new(config).unwrap();

        let headers = channel.build_headers();
        assert_eq!(headers["x-source"], "mailsift");
        assert_eq!(headers[reqwest::header::AUTHORIZATION], "Bearer secret");
    }

    #[test]
    fn test_payload_shape() {
        let notice = ReminderNotice {
            reminder_id: 3,
            tenant_id: 1,
            event_id: 2,
            title: "Exam".to_string(),
            description: String::new(),
            start_time: Utc::now(),
            location: "Hall B".to_string(),
            importance: "important".to_string(),
            remind_at: Utc::now(),
        };
        let payload = WebhookChannel::build_payload(&notice);
        assert_eq!(payload["event_type"], "reminder_due");
        assert_eq!(payload["location"], "Hall B");
        assert_eq!(payload["data"]["reminder_id"], 3);
    }
}
