//! Application State
//!
//! Shared state accessible by all API handlers.
//! Wrapped in Arc for thread-safe sharing across async tasks.

use crate::websocket::{ConnectionHub, HubConfig, IdentityResolver, TrustedHeaderResolver};
use std::sync::Arc;
use std::time::Instant;

/// Shared application state for all handlers
#[derive(Clone)]
pub struct AppState {
    /// WebSocket connection hub for real-time fan-out
    pub ws_hub: Arc<ConnectionHub>,
    /// Resolves the identity of connecting clients
    pub identity: Arc<dyn IdentityResolver>,
    /// API configuration
    pub config: Arc<ApiConfig>,
    /// Server start time for uptime tracking
    pub start_time: Instant,
}

impl AppState {
    /// Create a new AppState around an existing hub
    pub fn new(
        ws_hub: Arc<ConnectionHub>,
        identity: Arc<dyn IdentityResolver>,
        config: ApiConfig,
    ) -> Self {
        Self {
            ws_hub,
            identity,
            config: Arc::new(config),
            start_time: Instant::now(),
        }
    }

    /// Create AppState with a fresh hub and header-based identity
    pub fn with_ws_config(config: ApiConfig, hub_config: HubConfig) -> Self {
        Self::new(
            Arc::new(ConnectionHub::new(hub_config)),
            Arc::new(TrustedHeaderResolver::default()),
            config,
        )
    }

    /// Get server uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Get WebSocket connection count
    pub async fn ws_connection_count(&self) -> usize {
        self.ws_hub.active_connection_count().await
    }
}

/// API server configuration
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Allowed CORS origins; empty allows any
    pub cors_origins: Vec<String>,
    /// Maximum request body size in bytes
    pub max_body_size: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            cors_origins: Vec::new(),
            max_body_size: 1024 * 1024, // 1MB
        }
    }
}

impl ApiConfig {
    /// Create config with custom host and port
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Get the socket address string
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
