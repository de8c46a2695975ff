//! HTTP server wiring for the gateway.

use std::sync::Arc;

use axum::extract::State;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::channels::web::handlers;
use crate::config::ServerConfig;
use crate::error::Error;
use crate::history::HistoryStore;
use crate::jobs::Supervisor;
use crate::llm::ModelRegistry;
use crate::notify::PlatformNotifier;
use crate::store::KvStore;
use crate::stream::Multiplexer;

/// Shared services handed to every handler.
pub struct GatewayState {
    pub supervisor: Arc<Supervisor>,
    pub multiplexer: Multiplexer,
    pub history: Arc<HistoryStore>,
    pub registry: Arc<ModelRegistry>,
    pub notifier: Arc<PlatformNotifier>,
    pub store: Arc<dyn KvStore>,
}

/// Build the gateway router.
pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route(
            "/chat",
            get(handlers::chat_handler).post(handlers::chat_handler),
        )
        .route("/stream/{id}/{key}", get(handlers::stream_handler))
        .route(
            "/invoke",
            get(handlers::invoke_handler).post(handlers::invoke_handler),
        )
        .route("/models", get(handlers::models_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> Json<Value> {
    match state.store.ping().await {
        Ok(()) => Json(json!({ "status": "healthy", "store": "connected" })),
        Err(e) => {
            tracing::warn!(error = %e, "store ping failed");
            Json(json!({ "status": "unhealthy", "store": "disconnected" }))
        }
    }
}

/// Bind and serve until ctrl-c.
pub async fn start_server(config: &ServerConfig, state: Arc<GatewayState>) -> Result<(), Error> {
    let router = router(state);
    let addr = format!("{}:{}", config.host, config.port);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "gateway listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    Ok(())
}
