//! Relay Server
//!
//! HTTP surface of the relay, built with Axum.
//!
//! # Endpoints
//!
//! ## WebSocket
//! - `GET /ws` - Admission check, then upgrade to a relay connection
//!
//! ## Health
//! - `GET /health` - Plain "OK"
//! - `GET /health/live` - Liveness probe
//! - `GET /health/status` - Connection count, uptime and version
//!
//! # Example
//!
//! ```rust,ignore
//! use parley::config::Config;
//! use parley::server::{serve, AppState};
//! use parley::store::MemoryStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load_default();
//!     let server_config = config.server.clone();
//!     let state = AppState::with_store(config, Arc::new(MemoryStore::new()));
//!     serve(state, &server_config).await?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod health;
pub mod state;

pub use error::{ServerError, ServerResult};
pub use state::AppState;

use axum::{routing::get, Router};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::websocket::websocket_handler;

/// Build the router with all routes and middleware
pub fn build_router(state: AppState) -> Router {
    let health_routes = Router::new()
        .route("/", get(health::health))
        .route("/live", get(health::liveness))
        .route("/status", get(health::status));

    Router::new()
        .route("/ws", get(websocket_handler))
        .nest("/health", health_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

/// Bind the configured address and serve until Ctrl-C or SIGTERM
pub async fn serve(state: AppState, config: &ServerConfig) -> ServerResult<()> {
    let addr = config.addr();
    let listener = TcpListener::bind(&addr).await?;

    tracing::info!("Parley relay listening on {}", addr);
    serve_with_shutdown(listener, state, shutdown_signal()).await?;
    tracing::info!("Parley relay shut down gracefully");
    Ok(())
}

/// Serve on an already-bound listener until `shutdown` resolves
pub async fn serve_with_shutdown<F>(
    listener: TcpListener,
    state: AppState,
    shutdown: F,
) -> ServerResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let sweeper = state.governor.start_sweeper();
    let router = build_router(state);

    let result = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .map_err(|e| ServerError::Internal(format!("Server error: {}", e)));

    sweeper.abort();
    result
}

/// Wait for shutdown signal
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}
