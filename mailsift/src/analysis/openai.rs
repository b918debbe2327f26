//! OpenAI-compatible chat completions analyzer.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::{AnalysisContext, AnalysisFailure, AnalysisInput, AnalysisResult, Analyzer, parse_analysis};
use crate::Result;
use crate::utils::http_client::build_client;

const SYSTEM_PROMPT: &str = "You are an assistant that analyzes emails and extracts key information. \
Reply with a single JSON object and nothing else.";

/// Connection settings for an OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiCompatConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    /// HTTP-level timeout; the worker pool applies its own per-call timeout too.
    pub request_timeout: Duration,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for OpenAiCompatConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            request_timeout: Duration::from_secs(60),
            max_tokens: 2000,
            temperature: 0.1,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    error: Option<ErrorBody>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// [`Analyzer`] that calls `{base_url}/chat/completions`.
pub struct OpenAiCompatAnalyzer {
    client: Client,
    config: OpenAiCompatConfig,
}

impl OpenAiCompatAnalyzer {
    pub fn new(config: OpenAiCompatConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config.request_timeout)?,
            config,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    fn build_prompt(input: &AnalysisInput, ctx: &AnalysisContext) -> String {
        let received = input
            .received_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "unknown".to_string());
        format!(
            r#"Analyze the following email.

Current time: {now}
Received: {received}
Subject: {subject}
Body:
{body}

Return JSON in exactly this shape:
{{
  "summary": "one sentence summary",
  "importance_score": 1-10 (10 is most important),
  "importance_reason": "why",
  "events": [
    {{
      "title": "event title",
      "description": "event description",
      "start_time": "YYYY-MM-DD HH:MM:SS",
      "end_time": "YYYY-MM-DD HH:MM:SS or empty",
      "location": "location or empty",
      "importance_level": "important/normal/unimportant",
      "duration_type": "point/duration/deadline"
    }}
  ]
}}

Rules:
1. Resolve relative dates ("tomorrow", "next Monday") against the current time.
2. important (8-10): exams, deadlines, key meetings. normal (4-7): routine notices. unimportant (1-3): ads, optional events.
3. Create one event per distinct time point. Leave "events" empty when there is no time information."#,
            now = ctx.reference_time.format("%Y-%m-%d %H:%M:%S"),
            received = received,
            subject = input.subject,
            body = input.body,
        )
    }

    fn classify_error(status: StatusCode, body: &str) -> AnalysisFailure {
        let envelope: ErrorEnvelope = serde_json::from_str(body).unwrap_or_default();
        let error = envelope.error.unwrap_or_default();

        if status == StatusCode::PAYLOAD_TOO_LARGE
            || error.code.as_deref() == Some("context_length_exceeded")
        {
            return AnalysisFailure::PayloadTooLarge;
        }

        let message = error
            .message
            .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
        if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
            AnalysisFailure::Rejected(message)
        } else {
            AnalysisFailure::Upstream(message)
        }
    }
}

#[async_trait]
impl Analyzer for OpenAiCompatAnalyzer {
    async fn analyze(
        &self,
        input: &AnalysisInput,
        ctx: &AnalysisContext,
    ) -> std::result::Result<AnalysisResult, AnalysisFailure> {
        let body = json!({
            "model": self.config.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": Self::build_prompt(input, ctx)},
            ],
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
        });

        let mut request = self.client.post(self.endpoint()).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                AnalysisFailure::Timeout
            } else {
                AnalysisFailure::Upstream(e.to_string())
            }
        })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| AnalysisFailure::Upstream(e.to_string()))?;

        if !status.is_success() {
            let failure = Self::classify_error(status, &text);
            warn!(tenant = ctx.tenant, %status, error = %failure, "analysis request failed");
            return Err(failure);
        }

        let parsed: ChatResponse =
            serde_json::from_str(&text).map_err(|e| AnalysisFailure::Malformed(e.to_string()))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| AnalysisFailure::Malformed("empty completion".to_string()))?;

        debug!(tenant = ctx.tenant, len = content.len(), "analysis completion received");
        parse_analysis(&content, &self.config.model, Utc::now())
    }
}
