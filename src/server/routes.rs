//! Route definitions

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use super::handlers::{analyze, chat, health, list_models, model_info, AppState};

/// Create the `/api` router
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/models", get(list_models))
        .route("/api/model-info", get(model_info))
        .route("/api/chat", post(chat))
        .route("/api/analyze", post(analyze))
}
