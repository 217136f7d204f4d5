pub mod pty;
pub mod registry;
pub mod websocket;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::error::ServerError;
use registry::{RegistryConfig, TerminalRegistry};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<TerminalRegistry>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let registry = Arc::new(TerminalRegistry::new(RegistryConfig {
            backlog_max_bytes: config.backlog_max_bytes,
            snapshot_chunk_bytes: config.snapshot_chunk_bytes,
            exited_grace: config.exited_grace,
        }));
        Self {
            registry,
            config: Arc::new(config),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(websocket::ws_handler))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health_check() -> &'static str {
    "ok"
}

/// Binds the configured address and serves until the process is stopped.
pub async fn run(config: Config) -> Result<(), ServerError> {
    if config.auth_token.is_empty() {
        return Err(ServerError::EmptyAuthToken);
    }
    let addr = config.bind_addr();
    let state = AppState::new(config);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;
    info!(%addr, "freshell listening");
    serve(listener, state).await
}

/// Serves on an already-bound listener; tests use this with an ephemeral
/// port and their own registry state.
pub async fn serve(listener: TcpListener, state: AppState) -> Result<(), ServerError> {
    state.registry.spawn_idle_sweeper();
    axum::serve(listener, router(state))
        .await
        .map_err(ServerError::Io)?;
    Ok(())
}
