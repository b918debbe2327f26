//! API route modules.

pub mod health;
pub mod reminders;
pub mod sync;

use axum::Router;

use crate::api::server::AppState;

/// Create the main API router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .nest("/api/tenants/{tenant}/sync", sync::router())
        .nest("/api/tenants/{tenant}/reminders", reminders::router())
        .merge(health::router())
        .with_state(state)
}
