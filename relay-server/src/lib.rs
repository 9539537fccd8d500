//! The composition root: wires C1-C9 into one process exposing an inbound
//! webhook endpoint and a WebSocket hub over HTTP (spec §2, §6).

#![warn(clippy::all)]

mod error;
pub mod state;
mod webhook;
mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use relay_common::config::AppConfig;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use state::AppState;

#[derive(serde::Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "healthy", service: "relay-server", version: env!("CARGO_PKG_VERSION") })
}

async fn ready(State(_state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse { status: "ready", service: "relay-server", version: env!("CARGO_PKG_VERSION") })
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/webhook/:tenant_id", post(webhook::ingest_webhook))
        .route("/ws/:tenant_id/:user_id", get(ws::ws_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Starts the HTTP/WebSocket server: builds every component, recovers
/// orphaned debounce workers (spec §4.7 `supervise()`), spawns the Redis
/// pub/sub bridge feeding the hub (spec §4.5), then serves.
pub async fn start_server(config: &AppConfig) -> anyhow::Result<()> {
    let state = AppState::build(config).await?;

    match state.orchestrator.supervise().await {
        Ok(count) if count > 0 => tracing::info!(count, "recovered orphaned debounce workers"),
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "debounce supervisor scan failed"),
    }

    let redis_url = config.redis.url.clone();
    let hub = state.ws_hub.clone();
    tokio::spawn(async move { relay_ws::pubsub::run(&redis_url, hub).await });

    let addr = SocketAddr::from((config.network.bind.parse::<std::net::IpAddr>()?, config.network.port));
    let router = build_router(state);

    tracing::info!(%addr, "relay-server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
