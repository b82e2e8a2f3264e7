//! HTTP server for clinical chat
//!
//! JSON and SSE endpoints under `/api`, admission-controlled per client.

mod client;
mod error;
mod handlers;
mod routes;
mod streaming;
mod validation;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::DefaultBodyLimit;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use client::ClientIdentity;
pub use error::ApiError;
pub use handlers::{AppState, ChatResponse, HealthResponse, ModelInfoResponse, ModelsResponse};
pub use routes::api_routes;
pub use streaming::{sse_response, to_sse_event};
pub use validation::{
    AnalyzeForm, ChatMessage, ChatRequest, ContentItem, MessageContent, PreparedRequest,
    Validator, DEFAULT_ANALYZE_PROMPT,
};

/// Build the application router with its middleware stack
pub fn router(state: Arc<AppState>) -> Router {
    let max_body_size = state.server.max_body_size;
    let mut app = Router::new()
        .merge(api_routes())
        .layer(DefaultBodyLimit::max(max_body_size))
        .layer(TraceLayer::new_for_http());

    if state.server.cors_enabled {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        app = app.layer(cors);
    }

    app.with_state(state)
}

/// Bind and serve until the process is stopped
pub async fn start(state: Arc<AppState>) -> Result<()> {
    let addr = state.server.addr();
    let app = router(state);
    let listener = TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on http://{}", addr);
    tracing::info!("API endpoints:");
    tracing::info!("  GET  /api/health     - Server and model status");
    tracing::info!("  GET  /api/models     - Model catalog");
    tracing::info!("  GET  /api/model-info - Active model details");
    tracing::info!("  POST /api/chat       - Chat (SSE or JSON)");
    tracing::info!("  POST /api/analyze    - Image analysis (multipart, SSE)");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
