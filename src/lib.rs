//! # DeviceStream
//!
//! Real-time distribution of device telemetry over WebSockets.
//!
//! Producers publish sensor readings, device status changes and user
//! notifications over HTTP. Each connected client receives the readings for
//! the devices it subscribed to plus the notifications addressed to its user.
//! Delivery is best-effort: a client that falls behind is disconnected rather
//! than slowing anyone else down.
//!
//! ## Modules
//!
//! - [`websocket`]: Connection registry, topic index, dispatch router and
//!   per-connection session loops
//! - [`api`]: HTTP API server with Axum
//! - [`config`]: TOML configuration with environment overrides
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use devicestream::websocket::{ConnectionHub, HubConfig, UserId};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let hub = ConnectionHub::new(HubConfig::default());
//!
//!     // Normally done by the WebSocket handler on upgrade
//!     let (session, mut mailbox) = hub.open_session(Some(UserId(1))).await?;
//!     hub.registry().subscribe(session.id(), "greenhouse-7").await?;
//!
//!     let report = hub
//!         .publish_telemetry("greenhouse-7", json!({"humidity": 41}), chrono::Utc::now())
//!         .await;
//!     println!("Delivered to {} sessions", report.delivered);
//!
//!     let message = mailbox.recv().await;
//!     println!("{:?}", message);
//!
//!     hub.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod websocket;

pub use api::{build_router, serve, serve_with_shutdown, ApiConfig, ApiError, AppState};

pub use config::{Config, ConfigError, LoggingConfig, ServerConfig, WebSocketConfig};

pub use websocket::{
    websocket_handler, CloseReason, ConnectionHub, DeliveryReport, HubConfig, IdentityResolver,
    Message, MessageType, Payload, ShutdownReport, TrustedHeaderResolver, UserId,
};
