//! Axum HTTP server assembly.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::state::AppState;
use crate::{routes, stream, webhook};

/// Build the gateway router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/chat-stream", post(stream::chat_stream))
        .route("/chat", post(routes::chat))
        .route("/conversation", get(routes::conversation))
        .route("/conversation/clear", post(routes::clear_conversation))
        .route("/usage", get(routes::usage))
        .route("/webhooks/calendar", post(webhook::calendar_webhook))
        .route("/health", get(routes::health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until ctrl-c.
pub async fn serve(state: Arc<AppState>) -> anyhow::Result<()> {
    let addr = format!("{}:{}", state.config.bind_addr(), state.config.port());
    state.limiter.spawn_pruner(Duration::from_secs(60));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Gateway listening on {addr}");

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C handler");
    info!("Shutdown signal received");
}
