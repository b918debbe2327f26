//! Run control and progress streaming.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    response::sse::{Event, Sse},
    routing::{get, post},
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::database::models::TenantId;
use crate::events::ProgressEvent;
use crate::pipeline::RunOptions;
use crate::pipeline::worker_pool::{MAX_WORKERS, MIN_WORKERS};
use crate::task::{StartResponse, StatusSnapshot, Trigger};

/// Body of a start request. Every field is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartRequest {
    pub lookback_days: Option<u64>,
    pub max_items: Option<usize>,
    pub concurrency: Option<usize>,
}

impl StartRequest {
    fn into_options(self, default_concurrency: usize) -> ApiResult<RunOptions> {
        let defaults = RunOptions::default();
        if self.max_items == Some(0) {
            return Err(ApiError::validation("max_items must be positive"));
        }
        if let Some(concurrency) = self.concurrency
            && !(MIN_WORKERS..=MAX_WORKERS).contains(&concurrency)
        {
            return Err(ApiError::validation(format!(
                "concurrency must be between {MIN_WORKERS} and {MAX_WORKERS}"
            ))
            .with_details(serde_json::json!({ "min": MIN_WORKERS, "max": MAX_WORKERS })));
        }
        Ok(RunOptions {
            max_items: self.max_items,
            concurrency: self.concurrency.unwrap_or(default_concurrency),
            lookback: self
                .lookback_days
                .map(|days| Duration::from_secs(days.max(1) * 24 * 3600))
                .unwrap_or(defaults.lookback),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopResponse {
    pub stopped: bool,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/start", post(start_sync))
        .route("/stop", post(stop_sync))
        .route("/status", get(sync_status))
        .route("/stream", get(sync_stream))
}

async fn start_sync(
    State(state): State<AppState>,
    Path(tenant): Path<TenantId>,
    body: Bytes,
) -> ApiResult<Json<StartResponse>> {
    let request: StartRequest = if body.iter().all(u8::is_ascii_whitespace) {
        StartRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::bad_request(format!("invalid start request: {e}")))?
    };
    let options = request.into_options(state.default_concurrency)?;
    let response = state
        .controller
        .start(tenant, Trigger::Manual, options)
        .await?;
    Ok(Json(response))
}

async fn stop_sync(
    State(state): State<AppState>,
    Path(tenant): Path<TenantId>,
) -> Json<StopResponse> {
    Json(StopResponse {
        stopped: state.controller.stop(tenant),
    })
}

async fn sync_status(
    State(state): State<AppState>,
    Path(tenant): Path<TenantId>,
) -> Json<StatusSnapshot> {
    Json(state.controller.status(tenant))
}

fn sse_event(event: &ProgressEvent) -> Event {
    match serde_json::to_string(event) {
        Ok(data) => Event::default().data(data),
        Err(e) => {
            tracing::warn!(seq = event.seq, error = %e, "failed to encode event");
            Event::default().comment("unencodable event")
        }
    }
}

/// One `data:` line per event; the stream ends after the terminal event.
async fn sync_stream(
    State(state): State<AppState>,
    Path(tenant): Path<TenantId>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = state
        .controller
        .subscribe(tenant)
        .map(|event| Ok(sse_event(&event)));
    Sse::new(events)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_request_defaults() {
        let options = StartRequest::default().into_options(4).unwrap();
        assert_eq!(options.concurrency, 4);
        assert_eq!(options.max_items, None);
        assert_eq!(options.lookback, RunOptions::default().lookback);
    }

    #[test]
    fn test_start_request_rejects_bad_values() {
        let bad = StartRequest {
            concurrency: Some(9),
            ..Default::default()
        };
        assert!(bad.into_options(3).is_err());

        let bad = StartRequest {
            max_items: Some(0),
            ..Default::default()
        };
        assert!(bad.into_options(3).is_err());
    }
}
