//! Axum Router Configuration

use crate::{handlers, state::AppState};

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::services::ServeDir;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    let uploads = ServeDir::new(&app_state.config.uploads_dir);
    Router::new()
        .route("/api/session", get(handlers::create_session))
        .route("/api/responses", post(handlers::proxy_response))
        .nest_service("/atchalta/uploads", uploads)
        .with_state(app_state)
}
