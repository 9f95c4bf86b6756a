//! DeviceStream REST API
//!
//! HTTP API layer built with Axum. Producers publish over HTTP; consumers
//! receive over the WebSocket endpoint.
//!
//! # Endpoints
//!
//! ## WebSocket
//! - `GET /api/v1/ws` - Real-time streaming connection
//!
//! ## Publish
//! - `POST /api/v1/devices/:device_id/data` - Telemetry reading
//! - `POST /api/v1/devices/:device_id/status` - Device status change
//! - `POST /api/v1/notifications` - Notification for a user, or everyone
//!
//! ## Connections
//! - `GET /api/v1/connections` - Connection totals
//! - `GET /api/v1/connections/:user_id` - Connections of one user
//!
//! ## Health
//! - `GET /health/live` - Liveness probe
//! - `GET /health/ready` - Readiness probe
//! - `GET /health` - Full health status
//!
//! # Example
//!
//! ```rust,ignore
//! use devicestream::api::{serve, ApiConfig, AppState};
//! use devicestream::websocket::HubConfig;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ApiConfig::default();
//!     let state = AppState::with_ws_config(config.clone(), HubConfig::default());
//!     serve(state, &config).await?;
//!     Ok(())
//! }
//! ```

pub mod dto;
pub mod error;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use state::{ApiConfig, AppState};

use axum::{
    extract::DefaultBodyLimit,
    http::HeaderValue,
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};

use crate::websocket::websocket_handler;

/// Build the API router with all routes and middleware
pub fn build_router(state: AppState) -> Router {
    let api_routes = Router::new()
        // WebSocket route
        .route("/ws", get(websocket_handler))
        // Publish routes
        .route(
            "/devices/:device_id/data",
            post(routes::ingest::publish_device_data),
        )
        .route(
            "/devices/:device_id/status",
            post(routes::ingest::publish_device_status),
        )
        .route("/notifications", post(routes::ingest::publish_notification))
        // Connection routes
        .route("/connections", get(routes::connections::connection_stats))
        .route(
            "/connections/:user_id",
            get(routes::connections::identity_connections),
        )
        .layer(DefaultBodyLimit::max(state.config.max_body_size));

    let health_routes = Router::new()
        .route("/live", get(routes::health::liveness))
        .route("/ready", get(routes::health::readiness))
        .route("/", get(routes::health::full_health));

    let cors = cors_layer(&state.config.cors_origins);

    // Create shared state
    let shared_state = Arc::new(state);

    Router::new()
        .nest("/api/v1", api_routes)
        .nest("/health", health_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(shared_state)
}

/// Permissive when no origins are configured
fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::permissive();
    }

    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Start the API server and run until Ctrl+C or SIGTERM
pub async fn serve(state: AppState, config: &ApiConfig) -> Result<(), ApiError> {
    let addr = config.addr();
    let listener = TcpListener::bind(&addr).await?;

    tracing::info!("DeviceStream API listening on {}", addr);

    serve_with_shutdown(listener, state, shutdown_signal()).await
}

/// Serve on an already bound listener until `signal` resolves.
///
/// WebSocket sessions are closed through the hub as soon as the signal
/// fires; upgraded connections are not tracked by the HTTP server itself.
pub async fn serve_with_shutdown<F>(
    listener: TcpListener,
    state: AppState,
    signal: F,
) -> Result<(), ApiError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let hub = Arc::clone(&state.ws_hub);
    let router = build_router(state);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            signal.await;
            let report = hub.shutdown().await;
            tracing::info!(
                closed = report.closed,
                forced = report.forced,
                "WebSocket hub shut down"
            );
        })
        .await
        .map_err(|e| ApiError::Internal(format!("Server error: {}", e)))?;

    tracing::info!("DeviceStream API shut down gracefully");
    Ok(())
}

/// Wait for shutdown signal
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}
