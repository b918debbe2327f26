//! Reminder dispatch trigger.

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::post,
};
use chrono::Utc;

use crate::api::error::ApiResult;
use crate::api::server::AppState;
use crate::database::models::TenantId;
use crate::notification::DispatchSummary;

pub fn router() -> Router<AppState> {
    Router::new().route("/dispatch", post(dispatch_due))
}

async fn dispatch_due(
    State(state): State<AppState>,
    Path(tenant): Path<TenantId>,
) -> ApiResult<Json<DispatchSummary>> {
    let summary = state.dispatcher.dispatch_due(tenant, Utc::now()).await?;
    Ok(Json(summary))
}
